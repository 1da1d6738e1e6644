//! Broadcast session management.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use livemix_common::config::AppConfig;
use livemix_common::error::{LivemixError, LivemixResult};
use livemix_pipeline_core::{
    Background, BroadcastGraph, CapabilityProvider, ControllerConfig, FormatContract, Fraction,
    GraphBuilder, GraphState, LifecycleController, Leaky, OptionValue, PixelFormat, Placement,
    PlaybackSpec, PortId, PublishSpec, QueueConfig, RunOutcome, SourceSpec, StageId, StopReason,
    TeardownReport, TopologySpec,
};
use livemix_publish_engine::Endpoint;

use crate::provider::builtin_provider;

/// Everything a session needs to build and run its graph.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub topology: TopologySpec,
    /// Bound on each stage's resource acquisition (endpoint connect).
    pub acquire_timeout: Duration,
    /// Write the built graph as Graphviz DOT here.
    pub dump_graph: Option<PathBuf>,
}

fn queue(max_buffers: u32, leaky: bool) -> QueueConfig {
    QueueConfig::new(
        max_buffers as usize,
        if leaky { Leaky::Downstream } else { Leaky::No },
    )
}

fn option(key: &str, value: impl Into<OptionValue>) -> (String, OptionValue) {
    (key.to_string(), value.into())
}

impl SessionConfig {
    /// Map the application configuration onto a topology publishing to
    /// `location`.
    ///
    /// Capture sources run live; the local render branch presents frames
    /// as they arrive.
    pub fn from_app_config(config: &AppConfig, location: &str) -> LivemixResult<Self> {
        let endpoint: Endpoint = location
            .parse()
            .map_err(|e| LivemixError::config(format!("{e}")))?;

        let capture = &config.capture;
        let format: PixelFormat = capture
            .format
            .parse()
            .map_err(|e| LivemixError::config(format!("capture.format: {e}")))?;
        let background: Background = config
            .canvas
            .background
            .parse()
            .map_err(|e| LivemixError::config(format!("canvas.background: {e}")))?;
        if capture.sources.is_empty() {
            return Err(LivemixError::config("capture.sources must not be empty"));
        }

        let sources = capture
            .sources
            .iter()
            .map(|source| SourceSpec {
                options: vec![
                    option("pattern", source.pattern.as_str()),
                    option("is-live", true),
                ],
                placement: Placement::new(source.x, source.y),
            })
            .collect();

        let mut playback_sink = vec![option("sync", config.playback.sync)];
        if let Some(path) = &config.playback.snapshot {
            playback_sink.push(option("snapshot", path.display().to_string()));
        }

        let publish = &config.publish;
        Ok(Self {
            name: "livemix".to_string(),
            topology: TopologySpec {
                sources,
                capture_contract: FormatContract::raw(
                    format,
                    capture.width,
                    capture.height,
                    Fraction::new(capture.framerate_num, capture.framerate_den),
                ),
                canvas_width: config.canvas.width,
                canvas_height: config.canvas.height,
                background,
                playback: PlaybackSpec {
                    queue: queue(config.playback.queue_max_buffers, config.playback.queue_leaky),
                    sink: playback_sink,
                },
                publish: PublishSpec {
                    queue: queue(publish.queue_max_buffers, publish.queue_leaky),
                    encoder: vec![
                        option("bitrate", publish.bitrate_kbps),
                        option("key-int-max", publish.key_int_max),
                        option("speed-preset", publish.speed_preset.as_str()),
                        option("tune", publish.tune.as_str()),
                    ],
                    sink: vec![
                        option("location", endpoint.to_string()),
                        option("sync", publish.sync),
                    ],
                },
            },
            acquire_timeout: Duration::from_millis(publish.connect_timeout_ms),
            dump_graph: None,
        })
    }
}

/// Handles into the built graph.
#[derive(Debug, Clone)]
struct Handles {
    compositor: StageId,
    compositor_inputs: Vec<PortId>,
}

/// A broadcast from construction to teardown.
pub struct BroadcastSession {
    config: SessionConfig,
    provider: Arc<dyn CapabilityProvider>,
    controller: Option<LifecycleController>,
    handles: Option<Handles>,
}

impl BroadcastSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_provider(config, builtin_provider())
    }

    pub fn with_provider(config: SessionConfig, provider: Arc<dyn CapabilityProvider>) -> Self {
        Self {
            config,
            provider,
            controller: None,
            handles: None,
        }
    }

    /// Current graph state, `None` before the graph is built.
    pub fn state(&self) -> Option<GraphState> {
        self.controller.as_ref().map(LifecycleController::state)
    }

    pub fn controller(&self) -> Option<&LifecycleController> {
        self.controller.as_ref()
    }

    /// Build and link the graph (`Built`). A construction or link error
    /// leaves nothing behind.
    pub fn build(&mut self) -> LivemixResult<()> {
        if self.controller.is_some() {
            return Ok(());
        }
        let BroadcastGraph {
            graph,
            compositor,
            compositor_inputs,
            ..
        } = GraphBuilder::new(&self.config.name, self.provider.clone()).build(&self.config.topology)?;

        if let Some(path) = &self.config.dump_graph {
            std::fs::write(path, graph.to_dot())?;
            tracing::info!(path = %path.display(), "Graph written");
        }

        self.handles = Some(Handles {
            compositor,
            compositor_inputs,
        });
        self.controller = Some(LifecycleController::new(
            graph,
            ControllerConfig {
                acquire_timeout: self.config.acquire_timeout,
            },
        ));
        Ok(())
    }

    /// Build if needed and go to `Playing`. On failure the graph is torn
    /// down before the error is returned.
    pub async fn start(&mut self) -> LivemixResult<()> {
        self.build()?;
        let controller = self.controller_mut()?;
        if let Err(e) = controller.play().await {
            tracing::error!(error = %e, "Failed to start broadcast");
            controller.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Start, then dispatch until `shutdown` completes, every sink reaches
    /// end-of-stream, or a stage faults.
    pub async fn run<F>(&mut self, shutdown: F) -> LivemixResult<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        if self.state() != Some(GraphState::Playing) {
            self.start().await?;
        }
        let outcome = self.controller_mut()?.run(shutdown).await?;
        match &outcome.reason {
            StopReason::Fault(fault) => {
                tracing::error!(stage = %fault.stage, message = %fault.message, "Broadcast stopped by fault")
            }
            reason => tracing::info!(?reason, "Broadcast stopped"),
        }
        Ok(outcome)
    }

    pub fn set_background(&mut self, background: Background) -> LivemixResult<()> {
        let compositor = self.handles()?.compositor;
        self.controller_mut()?
            .graph_mut()
            .set_background(compositor, background)
    }

    /// Move source `index` on the canvas. Applies immediately while playing.
    pub fn set_placement(&mut self, index: usize, placement: Placement) -> LivemixResult<()> {
        let port = *self
            .handles()?
            .compositor_inputs
            .get(index)
            .ok_or_else(|| LivemixError::invalid_port(format!("no capture source {index}")))?;
        self.controller_mut()?.graph_mut().set_placement(port, placement)
    }

    /// Stop from any state and release everything.
    pub fn stop(&mut self) -> TeardownReport {
        self.controller
            .as_mut()
            .map(LifecycleController::stop)
            .unwrap_or_default()
    }

    fn handles(&self) -> LivemixResult<&Handles> {
        self.handles
            .as_ref()
            .ok_or_else(|| LivemixError::config("session graph has not been built"))
    }

    fn controller_mut(&mut self) -> LivemixResult<&mut LifecycleController> {
        self.controller
            .as_mut()
            .ok_or_else(|| LivemixError::config("session graph has not been built"))
    }
}

impl Drop for BroadcastSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_reproduce_standard_topology() {
        let config = SessionConfig::from_app_config(&AppConfig::default(), "rtmp://localhost/live/key")
            .unwrap();
        let topology = &config.topology;
        assert_eq!(topology.sources.len(), 3);
        assert_eq!(topology.sources[1].placement, Placement::new(640, 0));
        assert_eq!(topology.sources[2].placement, Placement::new(360, 360));
        assert_eq!(
            topology.capture_contract,
            FormatContract::raw(PixelFormat::I420, 640, 360, Fraction::new(30, 1))
        );
        assert_eq!((topology.canvas_width, topology.canvas_height), (640, 360));
        assert_eq!(topology.background, Background::Black);
        assert_eq!(topology.playback.queue, QueueConfig::new(5, Leaky::Downstream));
        assert!(topology.publish.encoder.contains(&option("bitrate", 3000u32)));
        assert!(topology.publish.encoder.contains(&option("key-int-max", 15u32)));
        assert!(topology
            .publish
            .sink
            .contains(&option("location", "rtmp://localhost:1935/live/key")));
        assert!(topology.sources.iter().all(|s| s.options.contains(&option("is-live", true))));
    }

    #[test]
    fn test_missing_location_is_a_construction_error() {
        let err = SessionConfig::from_app_config(&AppConfig::default(), "").unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("Please specify rtmp link to publish"));
    }

    #[test]
    fn test_bad_background_rejected() {
        let mut app = AppConfig::default();
        app.canvas.background = "plaid".into();
        assert!(SessionConfig::from_app_config(&app, "tcp://127.0.0.1:1").is_err());
    }

    #[test]
    fn test_live_changes_need_a_graph() {
        let config = SessionConfig::from_app_config(&AppConfig::default(), "tcp://127.0.0.1:1").unwrap();
        let mut session = BroadcastSession::new(config);
        assert!(session.set_background(Background::White).is_err());
        assert_eq!(session.state(), None);
        session.build().unwrap();
        assert_eq!(session.state(), Some(GraphState::Built));
        session.set_background(Background::White).unwrap();
        session.set_placement(2, Placement::new(10, 10)).unwrap();
        assert!(session.set_placement(3, Placement::new(0, 0)).is_err());
        session.stop();
        assert_eq!(session.state(), Some(GraphState::Stopped));
    }
}
