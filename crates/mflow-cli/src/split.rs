//! Stream splitter: one source, many outputs

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mflow::{ConnType, Mode, Payload, Stream, StreamConfig};
use mflow_core::{Error, FrameSource, Handler};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tracing::{info, warn};

/// Split configuration file
///
/// ```json
/// {
///     "source": {"address": "tcp://localhost:7777", "mode": "PULL"},
///     "streams": [{"address": "tcp://*:8888", "mode": "PUSH", "modulo": 10}]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SplitConfig {
    pub source: Endpoint,
    pub streams: Vec<Endpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub mode: Option<String>,
    /// Forward every Nth message only
    #[serde(default = "default_modulo")]
    pub modulo: u64,
}

fn default_modulo() -> u64 {
    1
}

impl Endpoint {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            mode: None,
            modulo: default_modulo(),
        }
    }

    fn mode_or(&self, default: Mode, allowed: [Mode; 2]) -> Result<Mode> {
        let Some(mode) = &self.mode else {
            return Ok(default);
        };
        let mode: Mode = mode
            .parse()
            .with_context(|| format!("Invalid mode for {}", self.address))?;
        if !allowed.contains(&mode) {
            bail!("Unsupported mode [{}] for {}", mode, self.address);
        }
        Ok(mode)
    }

    /// Config of the receiving side: pull (default) or sub
    pub fn source_config(&self) -> Result<StreamConfig> {
        let mode = self.mode_or(Mode::Pull, [Mode::Pull, Mode::Sub])?;
        Ok(StreamConfig::new(self.address.as_str(), mode))
    }

    /// Config of a sending side: push (default) or pub
    pub fn output_config(&self) -> Result<StreamConfig> {
        let mode = self.mode_or(Mode::Push, [Mode::Push, Mode::Pub])?;
        Ok(StreamConfig::new(self.address.as_str(), mode))
    }
}

impl SplitConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: SplitConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if config.streams.iter().any(|stream| stream.modulo == 0) {
            bail!("modulo must be at least 1");
        }
        Ok(config)
    }

    /// Source and outputs given on the command line
    pub fn from_args(source: &str, streams: &[String]) -> Self {
        Self {
            source: Endpoint::new(source),
            streams: streams.iter().map(|address| Endpoint::new(address)).collect(),
        }
    }
}

/// Forwards every frame of a received message to its outputs
pub struct Splitter {
    outputs: Vec<(Stream, u64)>,
    messages: u64,
}

impl Splitter {
    /// Open every output stream of `config`; `conn_type` overrides the
    /// connection type inferred from each address
    pub async fn connect(config: &SplitConfig, conn_type: Option<ConnType>) -> Result<Self> {
        let mut outputs = Vec::with_capacity(config.streams.len());
        for endpoint in &config.streams {
            let mut stream_config = endpoint.output_config()?;
            if let Some(conn_type) = conn_type {
                stream_config.conn_type = conn_type;
            }

            let mut stream = Stream::new();
            stream
                .connect(&stream_config)
                .await
                .with_context(|| format!("Failed to open output {}", endpoint.address))?;
            info!("Output {} every {} message(s)", endpoint.address, endpoint.modulo);
            outputs.push((stream, endpoint.modulo));
        }
        Ok(Self { outputs, messages: 0 })
    }

    pub fn outputs(&self) -> usize {
        self.outputs.len()
    }

    pub async fn disconnect(&mut self) {
        for (stream, _) in &mut self.outputs {
            stream.disconnect().await;
        }
    }
}

#[async_trait]
impl Handler for Splitter {
    async fn receive(&mut self, source: &mut dyn FrameSource) -> mflow_core::Result<Option<Payload>> {
        let index = self.messages;
        self.messages += 1;

        let mut frames = 0u64;
        loop {
            let Some(frame) = source.next().await? else {
                break;
            };
            let more = source.has_more();
            frames += 1;

            for (stream, modulo) in &mut self.outputs {
                if index % *modulo != 0 {
                    continue;
                }
                if let Err(e) = stream.send(frame.clone(), more, true).await {
                    warn!("Unable to forward frame to {:?}: {}", stream.address(), e);
                    return Err(Error::Transport(e.to_string()));
                }
            }

            if !more {
                break;
            }
        }

        if frames == 0 {
            return Ok(None);
        }
        Ok(Some(Payload::Json(json!({"message": index, "frames": frames}))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_configuration() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "source": {{"address": "tcp://localhost:7777", "mode": "SUB"}},
                "streams": [
                    {{"address": "tcp://*:8888", "mode": "PUSH"}},
                    {{"address": "tcp://*:8889", "mode": "pub", "modulo": 10}}
                ]
            }}"#
        )
        .unwrap();

        let config = SplitConfig::load(file.path()).unwrap();
        let source = config.source.source_config().unwrap();
        assert_eq!(source.mode, Mode::Sub);
        assert_eq!(source.conn_type, ConnType::Connect);

        assert_eq!(config.streams[0].modulo, 1);
        assert_eq!(config.streams[1].modulo, 10);
        let output = config.streams[1].output_config().unwrap();
        assert_eq!(output.mode, Mode::Pub);
        assert_eq!(output.conn_type, ConnType::Bind);
    }

    #[test]
    fn test_rejects_wrong_direction() {
        let mut endpoint = Endpoint::new("tcp://localhost:7777");
        endpoint.mode = Some("push".to_string());
        assert!(endpoint.source_config().is_err());

        endpoint.mode = Some("pull".to_string());
        assert!(endpoint.output_config().is_err());
    }

    #[test]
    fn test_rejects_zero_modulo() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"source": {{"address": "tcp://localhost:7777"}},
                "streams": [{{"address": "tcp://*:8888", "modulo": 0}}]}}"#
        )
        .unwrap();
        assert!(SplitConfig::load(file.path()).is_err());
    }

    #[tokio::test]
    async fn test_splitter_honours_modulo() {
        let address = "inproc://split-modulo";
        let mut config = SplitConfig::from_args("inproc://split-source", &[address.to_string()]);
        config.streams[0].modulo = 2;

        let mut splitter = Splitter::connect(&config, Some(ConnType::Bind)).await.unwrap();
        let mut receiver = Stream::new();
        let mut receiver_config = StreamConfig::new(address, Mode::Pull);
        receiver_config.receive_timeout_ms = Some(5_000);
        receiver.connect(&receiver_config).await.unwrap();

        let mut frames = mflow_core::FrameBuffer::new();
        for frame in 0..3 {
            let header = format!(r#"{{"htype":"raw-1.0","frame":{}}}"#, frame);
            frames.push_message([header.into_bytes(), b"data".to_vec()]);
        }
        for _ in 0..3 {
            assert!(splitter.receive(&mut frames).await.unwrap().is_some());
        }

        for expected in [0, 2] {
            let message = receiver.receive(true).await.unwrap().unwrap();
            assert_eq!(message.data().header()["frame"], expected);
        }
        assert!(receiver.receive(false).await.unwrap().is_none());

        receiver.disconnect().await;
        splitter.disconnect().await;
    }
}
