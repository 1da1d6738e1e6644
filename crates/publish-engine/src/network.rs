//! Network sink: writes the container stream to the publish endpoint.
//!
//! The connection is opened while the graph goes to `Playing`, so an
//! unreachable endpoint fails the transition instead of surfacing later as
//! a runtime fault.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use livemix_pipeline_core::{
    Caps, Direction, Encoding, FormatTemplate, OptionSpec, Payload, PortTemplate, Processor,
    StageConfig, StageContext, StageDescriptor, StageFactory, StageIo, StageKind,
};

use crate::endpoint::Endpoint;

type Output = Box<dyn Write + Send>;

fn descriptor() -> StageDescriptor {
    StageDescriptor::new(StageKind::NetworkSink, "Streams FLV to a publish endpoint")
        .port(PortTemplate::always(
            "sink",
            Direction::Input,
            Caps::from(FormatTemplate::new(vec![Encoding::Flv])),
        ))
        .option(OptionSpec::string("location", "", "Publish URI (rtmp://, tcp://, file://)"))
        .option(OptionSpec::boolean("sync", false, "Send data on the pipeline clock"))
}

pub struct NetworkSinkFactory {
    descriptor: Arc<StageDescriptor>,
}

impl NetworkSinkFactory {
    pub fn new() -> Self {
        Self {
            descriptor: Arc::new(descriptor()),
        }
    }
}

impl Default for NetworkSinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StageFactory for NetworkSinkFactory {
    fn descriptor(&self) -> Arc<StageDescriptor> {
        self.descriptor.clone()
    }

    fn create(&self, config: &StageConfig) -> anyhow::Result<Box<dyn Processor>> {
        Ok(Box::new(NetworkSink {
            location: config.option_str("location")?.to_string(),
            sync: config.option_bool("sync")?,
            output: None,
        }))
    }
}

struct NetworkSink {
    location: String,
    sync: bool,
    output: Option<Output>,
}

async fn open(endpoint: &Endpoint) -> anyhow::Result<Output> {
    match endpoint {
        Endpoint::File(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Could not open {} for writing", path.display()))?;
            Ok(Box::new(std::io::BufWriter::new(file)))
        }
        Endpoint::Stream { .. } => {
            let addr = endpoint.socket_addr().context("endpoint has no address")?;
            let stream = tokio::net::TcpStream::connect(&addr)
                .await
                .with_context(|| format!("Could not connect to {addr}"))?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
            }
            // Stage threads write with blocking I/O.
            let stream = stream.into_std()?;
            stream.set_nonblocking(false)?;
            Ok(Box::new(stream))
        }
    }
}

#[async_trait]
impl Processor for NetworkSink {
    async fn acquire(&mut self) -> anyhow::Result<()> {
        let endpoint: Endpoint = self.location.parse()?;
        self.output = Some(open(&endpoint).await?);
        tracing::info!(%endpoint, "Publish endpoint connected");
        Ok(())
    }

    fn run(self: Box<Self>, io: StageIo, ctx: StageContext) -> anyhow::Result<()> {
        let NetworkSink {
            location,
            sync,
            output,
        } = *self;
        let input = io.into_input()?;
        let mut output = output.context("network sink was not acquired")?;
        let mut sent = 0usize;
        let mut chunks = 0u64;

        while let Some(buffer) = input.pop(&ctx.stop) {
            if sync && !ctx.wait_until(buffer.pts_ns) {
                break;
            }
            let Payload::Stream(bytes) = &buffer.payload else {
                anyhow::bail!("network sink received a non-stream buffer");
            };
            output
                .write_all(bytes)
                .with_context(|| format!("Could not write to {location}"))?;
            if chunks == 0 {
                ctx.reporter.first_buffer();
            }
            sent += bytes.len();
            chunks += 1;
        }
        output
            .flush()
            .with_context(|| format!("Could not flush {location}"))?;
        tracing::info!(stage = %ctx.name, chunks, bytes = sent, "Network sink finished");
        Ok(())
    }
}
