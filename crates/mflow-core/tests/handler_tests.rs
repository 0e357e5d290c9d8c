//! Built-in handler tests
//!
//! Decoding is driven from hand-built frame sequences so the part layout of
//! each type tag is pinned down independently of the encoders.

use bytes::Bytes;
use mflow_core::handlers::{
    ArrayHandler, BsrMData, BsrMHandler, ChannelTimestamp, ChannelValue, DHeaderHandler, DImageHandler,
    DSeriesEndHandler, HeaderDetail, RawHandler,
};
use mflow_core::{DType, Error, FrameBuffer, Handler, Payload};
use serde_json::{json, Value};

fn json_frame(value: Value) -> Bytes {
    Bytes::from(serde_json::to_vec(&value).unwrap())
}

// ============================================================================
// raw-1.0
// ============================================================================

#[tokio::test]
async fn test_raw_segments() {
    let mut frames = FrameBuffer::from_message([
        json_frame(json!({"htype": "raw-1.0", "frame": 0})),
        Bytes::from_static(b"first"),
        Bytes::new(),
        Bytes::from_static(b"third"),
    ]);

    let payload = RawHandler.receive(&mut frames).await.unwrap().unwrap();
    let Payload::Raw(raw) = payload else {
        panic!("expected raw payload");
    };

    assert_eq!(raw.header["frame"], 0);
    assert_eq!(raw.data.len(), 3);
    assert_eq!(raw.data[0].as_deref(), Some(&b"first"[..]));
    assert!(raw.data[1].is_none());
    assert_eq!(raw.data[2].as_deref(), Some(&b"third"[..]));
}

#[tokio::test]
async fn test_raw_send_flags() {
    let payload = Payload::Raw(mflow_core::handlers::RawData {
        header: json!({"htype": "raw-1.0"}),
        data: vec![Some(Bytes::from_static(b"a")), None],
    });

    let mut sink = FrameBuffer::new();
    RawHandler.send(&payload, &mut sink, true).await.unwrap();

    let flags: Vec<bool> = sink.frames().map(|(_, more)| more).collect();
    assert_eq!(flags, vec![true, true, false]);
    let last = sink.frames().last().unwrap().0.clone();
    assert!(last.is_empty());
}

// ============================================================================
// array-1.0
// ============================================================================

#[tokio::test]
async fn test_array_decode_int32() {
    let values: Vec<u8> = (0..10i32).flat_map(|v| v.to_le_bytes()).collect();
    let mut frames = FrameBuffer::from_message([
        json_frame(json!({"htype": "array-1.0", "type": "int32", "shape": [10], "frame": 1})),
        Bytes::from(values),
    ]);

    let payload = ArrayHandler.receive(&mut frames).await.unwrap().unwrap();
    let Payload::Array(array) = payload else {
        panic!("expected array payload");
    };

    assert_eq!(array.dtype, DType::Int32);
    assert_eq!(array.shape, vec![10]);
    let first = array.data[0].as_ref().unwrap();
    assert_eq!(first.to_vec::<i32>().unwrap(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_array_big_endian_header() {
    let mut frames = FrameBuffer::from_message([
        json_frame(json!({"htype": "array-1.0", "type": "uint16", "shape": [2], "endianness": "big"})),
        Bytes::from_static(&[0x00, 0x02, 0x00, 0x03]),
    ]);

    let Payload::Array(array) = ArrayHandler.receive(&mut frames).await.unwrap().unwrap() else {
        panic!("expected array payload");
    };
    assert_eq!(array.data[0].as_ref().unwrap().to_vec::<u16>().unwrap(), vec![2, 3]);
}

#[tokio::test]
async fn test_array_wrong_size_fails() {
    let mut frames = FrameBuffer::from_message([
        json_frame(json!({"htype": "array-1.0", "type": "float64", "shape": [2, 2]})),
        Bytes::from(vec![0u8; 24]),
    ]);

    let err = ArrayHandler.receive(&mut frames).await.unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
}

#[tokio::test]
async fn test_array_huge_shape_fails_without_panic() {
    let mut frames = FrameBuffer::from_message([
        json_frame(json!({"htype": "array-1.0", "type": "uint64", "shape": [4611686018427387904u64, 8]})),
        Bytes::from(vec![0u8; 8]),
    ]);

    let err = ArrayHandler.receive(&mut frames).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn test_array_missing_shape_fails() {
    let mut frames =
        FrameBuffer::from_message([json_frame(json!({"htype": "array-1.0", "type": "int8"}))]);

    let err = ArrayHandler.receive(&mut frames).await.unwrap_err();
    assert!(err.to_string().contains("shape"));
}

#[tokio::test]
async fn test_array_encode_then_decode() {
    let values: Vec<u8> = [1.0f64, 2.0, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect();
    let mut source = FrameBuffer::from_message([
        json_frame(json!({"htype": "array-1.0", "type": "float64", "shape": [3]})),
        Bytes::from(values.clone()),
        Bytes::from(values),
    ]);
    let decoded = ArrayHandler.receive(&mut source).await.unwrap().unwrap();

    let mut wire = FrameBuffer::new();
    ArrayHandler.send(&decoded, &mut wire, true).await.unwrap();
    assert_eq!(wire.len(), 3);

    let again = ArrayHandler.receive(&mut wire).await.unwrap().unwrap();
    assert_eq!(again, decoded);
}

// ============================================================================
// dheader-1.0
// ============================================================================

fn dheader_all_frames(appendix: bool) -> Vec<Bytes> {
    let mut frames = vec![
        json_frame(json!({"htype": "dheader-1.0", "series": 4, "header_detail": "all"})),
        json_frame(json!({"beam_center_x": 1.5})),
        json_frame(json!({"htype": "dflatfield-1.0", "shape": [2, 2]})),
        Bytes::from(vec![1u8; 16]),
        json_frame(json!({"htype": "dpixelmask-1.0", "shape": [2, 2]})),
        Bytes::from(vec![2u8; 16]),
        json_frame(json!({"htype": "dcountrate_table-1.0", "shape": [2, 2]})),
        Bytes::from(vec![3u8; 16]),
    ];
    if appendix {
        frames.push(json_frame(json!({"user": "note"})));
    }
    frames
}

#[tokio::test]
async fn test_dheader_all_with_appendix() {
    let mut frames = FrameBuffer::from_message(dheader_all_frames(true));

    let Payload::DHeader(header) = DHeaderHandler.receive(&mut frames).await.unwrap().unwrap() else {
        panic!("expected dheader payload");
    };

    assert_eq!(header.detail, HeaderDetail::All);
    assert_eq!(header.config.as_ref().unwrap()["beam_center_x"], 1.5);
    assert_eq!(header.flatfield.as_ref().unwrap().raw.len(), 16);
    assert_eq!(header.pixel_mask.as_ref().unwrap().raw[0], 2);
    assert_eq!(header.countrate_table.as_ref().unwrap().description["htype"], "dcountrate_table-1.0");
    assert_eq!(header.appendix, Some(json!({"user": "note"})));
    assert!(frames.is_empty());
}

#[tokio::test]
async fn test_dheader_basic_and_none() {
    let mut basic = FrameBuffer::from_message([
        json_frame(json!({"htype": "dheader-1.0", "header_detail": "basic"})),
        json_frame(json!({"x_pixels": 1030})),
    ]);
    let Payload::DHeader(header) = DHeaderHandler.receive(&mut basic).await.unwrap().unwrap() else {
        panic!("expected dheader payload");
    };
    assert_eq!(header.detail, HeaderDetail::Basic);
    assert!(header.config.is_some());
    assert!(header.flatfield.is_none());
    assert!(header.appendix.is_none());

    let mut none = FrameBuffer::from_message([
        json_frame(json!({"htype": "dheader-1.0", "header_detail": "none"})),
        json_frame(json!({"appendix": true})),
    ]);
    let Payload::DHeader(header) = DHeaderHandler.receive(&mut none).await.unwrap().unwrap() else {
        panic!("expected dheader payload");
    };
    assert!(header.config.is_none());
    assert_eq!(header.appendix, Some(json!({"appendix": true})));
}

#[tokio::test]
async fn test_dheader_send_matches_receive_layout() {
    let mut source = FrameBuffer::from_message(dheader_all_frames(false));
    let decoded = DHeaderHandler.receive(&mut source).await.unwrap().unwrap();

    let mut wire = FrameBuffer::new();
    DHeaderHandler.send(&decoded, &mut wire, true).await.unwrap();

    let flags: Vec<bool> = wire.frames().map(|(_, more)| more).collect();
    assert_eq!(flags, vec![true, true, true, true, true, true, true, false]);
}

#[tokio::test]
async fn test_dheader_unknown_detail() {
    let mut frames = FrameBuffer::from_message([json_frame(
        json!({"htype": "dheader-1.0", "header_detail": "everything"}),
    )]);
    let err = DHeaderHandler.receive(&mut frames).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

// ============================================================================
// dimage-1.0 / dseries_end-1.0
// ============================================================================

#[tokio::test]
async fn test_dimage_four_parts() {
    let mut frames = FrameBuffer::from_message([
        json_frame(json!({"htype": "dimage-1.0", "series": 1, "frame": 7})),
        json_frame(json!({"htype": "dimage_d-1.0", "shape": [4, 4], "type": "uint16"})),
        Bytes::from(vec![0u8; 32]),
        json_frame(json!({"htype": "dconfig-1.0", "start_time": 0})),
    ]);

    let Payload::DImage(image) = DImageHandler.receive(&mut frames).await.unwrap().unwrap() else {
        panic!("expected dimage payload");
    };
    assert_eq!(image.header["frame"], 7);
    assert_eq!(image.image.len(), 32);
    assert!(image.appendix.is_none());
}

#[tokio::test]
async fn test_dimage_send_includes_appendix() {
    let payload = Payload::DImage(mflow_core::handlers::DImageData {
        header: json!({"htype": "dimage-1.0"}),
        image_header: json!({"shape": [1]}),
        image: Bytes::from_static(b"\x01"),
        trailer: json!({"stop_time": 1}),
        appendix: Some(json!({"tag": "a"})),
    });

    let mut wire = FrameBuffer::new();
    DImageHandler.send(&payload, &mut wire, false).await.unwrap();
    assert_eq!(wire.len(), 5);

    let again = DImageHandler.receive(&mut wire).await.unwrap().unwrap();
    assert_eq!(again, payload);
}

#[tokio::test]
async fn test_dimage_truncated_fails() {
    let mut frames = FrameBuffer::from_message([
        json_frame(json!({"htype": "dimage-1.0"})),
        json_frame(json!({"shape": [1]})),
    ]);
    let err = DImageHandler.receive(&mut frames).await.unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
}

#[tokio::test]
async fn test_dseries_end() {
    let mut frames =
        FrameBuffer::from_message([json_frame(json!({"htype": "dseries_end-1.0", "series": 2}))]);
    let payload = DSeriesEndHandler.receive(&mut frames).await.unwrap().unwrap();
    assert_eq!(payload.htype(), Some("dseries_end-1.0"));
}

// ============================================================================
// bsr_m-1.0
// ============================================================================

fn bsr_header(pulse_id: u64, hash: &str) -> Bytes {
    json_frame(json!({"htype": "bsr_m-1.0", "pulse_id": pulse_id, "hash": hash}))
}

fn bsr_data_header() -> Bytes {
    json_frame(json!({
        "htype": "bsr_d-1.0",
        "channels": [
            {"name": "temperature", "type": "double"},
            {"name": "counter", "type": "int32", "encoding": "big"},
        ]
    }))
}

fn timestamp(sec: u64, ns: u64, big: bool) -> Bytes {
    let (sec, ns) = if big {
        (sec.to_be_bytes(), ns.to_be_bytes())
    } else {
        (sec.to_le_bytes(), ns.to_le_bytes())
    };
    Bytes::from([sec, ns].concat())
}

fn bsr_message(pulse_id: u64, hash: &str, data_header: Bytes) -> FrameBuffer {
    FrameBuffer::from_message([
        bsr_header(pulse_id, hash),
        data_header,
        Bytes::copy_from_slice(&1.5f64.to_le_bytes()),
        timestamp(10, 20, false),
        Bytes::copy_from_slice(&42i32.to_be_bytes()),
        timestamp(11, 21, true),
    ])
}

fn bsr_data(payload: Payload) -> BsrMData {
    match payload {
        Payload::BsrM(data) => data,
        other => panic!("expected bsr_m payload, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bsr_m_parses_new_data_header() {
    let mut handler = BsrMHandler::new();
    let mut frames = bsr_message(7, "abc", bsr_data_header());

    let data = bsr_data(handler.receive(&mut frames).await.unwrap().unwrap());
    assert!(data.header_changed);
    assert!(!data.no_channels);
    assert_eq!(data.pulse_id, 7);
    assert_eq!(data.size, 12);
    assert_eq!(data.readings.len(), 2);

    let temperature = data.readings[0].as_ref().unwrap();
    let ChannelValue::Number(value) = &temperature.value else {
        panic!("expected a number");
    };
    assert_eq!(value.to_vec::<f64>().unwrap(), vec![1.5]);
    assert_eq!(temperature.timestamp, Some(ChannelTimestamp { sec: 10, ns: 20 }));

    let counter = data.readings[1].as_ref().unwrap();
    let ChannelValue::Number(value) = &counter.value else {
        panic!("expected a number");
    };
    assert_eq!(value.to_vec::<i32>().unwrap(), vec![42]);
    assert_eq!(counter.timestamp, Some(ChannelTimestamp { sec: 11, ns: 21 }));

    assert_eq!(handler.header_hash(), Some(&json!("abc")));
    assert_eq!(handler.channels().len(), 2);
}

#[tokio::test]
async fn test_bsr_m_same_hash_skips_data_header() {
    let mut handler = BsrMHandler::new();
    let mut first = bsr_message(1, "abc", bsr_data_header());
    handler.receive(&mut first).await.unwrap();

    // Not JSON: only a changed hash would make the handler parse it.
    let mut second = bsr_message(2, "abc", Bytes::from_static(b"not parsed"));
    let data = bsr_data(handler.receive(&mut second).await.unwrap().unwrap());

    assert!(!data.header_changed);
    assert_eq!(data.pulse_id, 2);
    assert_eq!(data.readings.iter().flatten().count(), 2);
}

#[tokio::test]
async fn test_bsr_m_changed_hash_reparses() {
    let mut handler = BsrMHandler::new();
    let mut first = bsr_message(1, "abc", bsr_data_header());
    handler.receive(&mut first).await.unwrap();

    let mut second = bsr_message(2, "def", Bytes::from_static(b"not json"));
    assert!(handler.receive(&mut second).await.is_err());
    assert_eq!(handler.header_hash(), Some(&json!("abc")));
}

#[tokio::test]
async fn test_bsr_m_without_channels() {
    let mut handler = BsrMHandler::new();
    let mut frames = FrameBuffer::from_message([
        bsr_header(3, "empty"),
        json_frame(json!({"htype": "bsr_d-1.0", "channels": []})),
        Bytes::from_static(b"leftover"),
    ]);

    let data = bsr_data(handler.receive(&mut frames).await.unwrap().unwrap());
    assert!(data.no_channels);
    assert!(data.readings.is_empty());
    assert!(frames.is_empty());
}

#[tokio::test]
async fn test_bsr_m_empty_channel_and_resend() {
    let mut frames = FrameBuffer::from_message([
        bsr_header(4, "abc"),
        bsr_data_header(),
        Bytes::new(),
        Bytes::new(),
        Bytes::copy_from_slice(&9i32.to_be_bytes()),
        timestamp(12, 22, true),
    ]);
    let decoded = BsrMHandler::new().receive(&mut frames).await.unwrap().unwrap();
    let data = bsr_data(decoded.clone());
    assert!(data.readings[0].is_none());
    assert!(data.readings[1].is_some());

    let mut wire = FrameBuffer::new();
    BsrMHandler::new().send(&decoded, &mut wire, true).await.unwrap();
    assert_eq!(wire.len(), 6);

    let again = bsr_data(BsrMHandler::new().receive(&mut wire).await.unwrap().unwrap());
    assert_eq!(again.readings, data.readings);
}

#[tokio::test]
async fn test_send_rejects_foreign_payload() {
    let payload = Payload::Json(json!({"htype": "raw-1.0"}));
    let mut wire = FrameBuffer::new();

    let err = DImageHandler.send(&payload, &mut wire, true).await.unwrap_err();
    assert!(matches!(err, Error::Encode(_)));
    assert!(wire.is_empty());
}
