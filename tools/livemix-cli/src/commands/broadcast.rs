//! Run a broadcast session.

use std::time::Duration;

use livemix_broadcast_engine::{BroadcastSession, SessionConfig};
use livemix_common::config::{AppConfig, SourceConfig};
use livemix_common::error::{LivemixError, LivemixResult};
use livemix_pipeline_core::StopReason;

use crate::BroadcastArgs;

/// Offset between sources added beyond the configured ones.
const CASCADE: (i32, i32) = (32, 18);

/// Apply command-line overrides to the loaded configuration.
pub fn apply_overrides(config: &mut AppConfig, args: &BroadcastArgs) {
    if let Some(link) = &args.rtmp_link {
        config.publish.location = Some(link.clone());
    }
    if let Some(bitrate) = args.bitrate {
        config.publish.bitrate_kbps = bitrate;
    }
    if let Some(key_int) = args.key_int {
        config.publish.key_int_max = key_int;
    }
    if let Some(count) = args.sources {
        let sources = &mut config.capture.sources;
        let configured = sources.len();
        sources.truncate(count);
        for i in configured..count {
            let step = (i - configured + 1) as i32;
            sources.push(SourceConfig {
                x: CASCADE.0 * step,
                y: CASCADE.1 * step,
                ..SourceConfig::default()
            });
        }
    }
}

/// Parse `--duration` seconds.
fn run_duration(secs: Option<f64>) -> LivemixResult<Option<Duration>> {
    secs.map(|secs| {
        Duration::try_from_secs_f64(secs)
            .map_err(|e| LivemixError::config(format!("Invalid --duration {secs}: {e}")))
    })
    .transpose()
}

pub async fn run(args: BroadcastArgs, mut config: AppConfig) -> LivemixResult<()> {
    apply_overrides(&mut config, &args);
    let Some(location) = config.publish.location.clone().filter(|l| !l.trim().is_empty()) else {
        return Err(LivemixError::config("Please specify rtmp link to publish"));
    };
    let duration = run_duration(args.duration)?;

    let mut session_config = SessionConfig::from_app_config(&config, &location)?;
    session_config.dump_graph = args.dump_graph.clone();

    println!("Publishing to: {location}");
    println!("  Sources: {}", session_config.topology.sources.len());
    println!(
        "  Canvas: {}x{} ({})",
        session_config.topology.canvas_width,
        session_config.topology.canvas_height,
        session_config.topology.background
    );
    println!("  Bitrate: {} kbit/s", config.publish.bitrate_kbps);
    println!("  Key interval: {} frames", config.publish.key_int_max);
    println!();

    let mut session = BroadcastSession::new(session_config);
    session.start().await?;

    let shutdown = async move {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => {
                println!("Press Ctrl+C to stop...");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Could not listen for Ctrl+C");
                    std::future::pending::<()>().await;
                }
            }
        }
    };
    let outcome = session.run(shutdown).await?;

    for link in outcome.links.iter().filter(|l| l.dropped > 0) {
        println!("  {}: {} dropped of {}", link.link, link.dropped, link.pushed);
    }
    match outcome.reason {
        StopReason::Fault(fault) => Err(fault.into_error()),
        StopReason::Shutdown | StopReason::EndOfStream => {
            println!("Broadcast stopped.");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let mut config = AppConfig::default();
        let args = BroadcastArgs {
            rtmp_link: Some("rtmp://example.com/live".into()),
            sources: Some(5),
            bitrate: Some(1500),
            key_int: Some(30),
            ..BroadcastArgs::default()
        };
        apply_overrides(&mut config, &args);
        assert_eq!(config.publish.location.as_deref(), Some("rtmp://example.com/live"));
        assert_eq!(config.publish.bitrate_kbps, 1500);
        assert_eq!(config.publish.key_int_max, 30);
        let sources = &config.capture.sources;
        assert_eq!(sources.len(), 5);
        assert_eq!((sources[2].x, sources[2].y), (360, 360));
        assert_eq!((sources[3].x, sources[3].y), (32, 18));
        assert_eq!((sources[4].x, sources[4].y), (64, 36));
    }

    #[test]
    fn test_fewer_sources_truncates() {
        let mut config = AppConfig::default();
        let args = BroadcastArgs {
            sources: Some(1),
            ..BroadcastArgs::default()
        };
        apply_overrides(&mut config, &args);
        assert_eq!(config.capture.sources.len(), 1);
        assert_eq!(config.publish.bitrate_kbps, 3000);
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(run_duration(None).unwrap(), None);
        assert_eq!(run_duration(Some(1.5)).unwrap(), Some(Duration::from_millis(1500)));
        for bad in [f64::INFINITY, f64::NAN, -1.0, 1e30] {
            let err = run_duration(Some(bad)).unwrap_err();
            assert_eq!(err.exit_code(), 1);
        }
    }

    #[tokio::test]
    async fn test_bad_duration_fails_before_building() {
        let args = BroadcastArgs {
            rtmp_link: Some("tcp://127.0.0.1:1".into()),
            duration: Some(f64::INFINITY),
            ..BroadcastArgs::default()
        };
        let err = run(args, AppConfig::default()).await.unwrap_err();
        assert!(err.to_string().contains("Invalid --duration"));
    }

    #[tokio::test]
    async fn test_missing_link() {
        let err = run(BroadcastArgs::default(), AppConfig::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: Please specify rtmp link to publish");
        assert_eq!(err.exit_code(), 1);
    }
}
