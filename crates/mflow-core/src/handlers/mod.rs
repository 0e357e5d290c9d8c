//! Built-in message types
//!
//! | tag               | frames                                                   |
//! |-------------------|----------------------------------------------------------|
//! | `raw-1.0`         | header, N opaque segments                                |
//! | `array-1.0`       | header (dtype + shape), N row-major arrays               |
//! | `dheader-1.0`     | header, 0/1/7 detail frames by `header_detail`, appendix? |
//! | `dimage-1.0`      | header, sub-header, image bytes, trailer, appendix?      |
//! | `dseries_end-1.0` | header                                                   |
//! | `bsr_m-1.0`       | header, data header, value + timestamp per channel       |

pub mod array;
pub mod bsr_m;
pub mod dheader;
pub mod dimage;
pub mod dseries_end;
pub mod raw;

pub use array::{ArrayData, ArrayHandler};
pub use bsr_m::{BsrMData, BsrMHandler, Channel, ChannelKind, ChannelReading, ChannelTimestamp, ChannelValue};
pub use dheader::{DHeaderData, DHeaderHandler, DescribedBlob, HeaderDetail};
pub use dimage::{DImageData, DImageHandler};
pub use dseries_end::{DSeriesEndData, DSeriesEndHandler};
pub use raw::{RawData, RawHandler};

use crate::handler::Handler;

pub const RAW: &str = "raw-1.0";
pub const ARRAY: &str = "array-1.0";
pub const DHEADER: &str = "dheader-1.0";
pub const DIMAGE: &str = "dimage-1.0";
pub const DSERIES_END: &str = "dseries_end-1.0";
pub const BSR_M: &str = "bsr_m-1.0";

/// Tags registered in every default registry
pub const BUILTIN_TAGS: [&str; 6] = [RAW, ARRAY, DHEADER, DIMAGE, DSERIES_END, BSR_M];

/// Fresh handler for an exact built-in tag
pub fn builtin(htype: &str) -> Option<Box<dyn Handler>> {
    match htype {
        RAW => Some(Box::new(RawHandler)),
        ARRAY => Some(Box::new(ArrayHandler)),
        DHEADER => Some(Box::new(DHeaderHandler)),
        DIMAGE => Some(Box::new(DImageHandler)),
        DSERIES_END => Some(Box::new(DSeriesEndHandler)),
        BSR_M => Some(Box::new(BsrMHandler::new())),
        _ => None,
    }
}

/// Split `name-MAJOR.MINOR` into its family name and major version
pub fn split_htype(htype: &str) -> Option<(&str, u32)> {
    let (family, version) = htype.rsplit_once('-')?;
    let major = version.split('.').next()?.parse().ok()?;
    if family.is_empty() {
        return None;
    }
    Some((family, major))
}

/// Default loader: a later minor revision of a built-in type is decoded by
/// the built-in handler of the same family and major version
pub fn load_family(htype: &str) -> Option<Box<dyn Handler>> {
    let (family, major) = split_htype(htype)?;
    BUILTIN_TAGS
        .iter()
        .find(|tag| split_htype(tag) == Some((family, major)))
        .and_then(|tag| builtin(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_htype() {
        assert_eq!(split_htype("array-1.0"), Some(("array", 1)));
        assert_eq!(split_htype("dseries_end-1.4"), Some(("dseries_end", 1)));
        assert_eq!(split_htype("my-type-2.1"), Some(("my-type", 2)));
        assert_eq!(split_htype("array"), None);
        assert_eq!(split_htype("-1.0"), None);
        assert_eq!(split_htype("array-x.0"), None);
    }

    #[test]
    fn test_load_family() {
        assert!(load_family("array-1.7").is_some());
        assert!(load_family("raw-1.1").is_some());
        assert!(load_family("bsr_m-1.1").is_some());
        assert!(load_family("array-2.0").is_none());
        assert!(load_family("bogus-9.9").is_none());
    }
}
