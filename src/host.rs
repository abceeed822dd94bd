//! # Host Event Adapter
//!
//! Reads sensor events and location fixes as newline-delimited JSON.
//!
//! ```text
//! {"kind":"sensor","sensor":"heart_rate","accuracy":3,"timestamp":1,"values":[72.0]}
//! {"kind":"location","latitude":45.0,"longitude":-73.0,"accuracy":5.0}
//! ```

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::sensor::{LocationFix, RawSensorEvent};

/// One line of host input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HostEvent {
    Sensor(RawSensorEvent),
    Location(LocationFix),
}

/// Parse a single input line.
pub fn parse_line(line: &str) -> Result<HostEvent> {
    Ok(serde_json::from_str(line)?)
}

/// Forward events from `reader` until end of input.
///
/// Malformed lines are logged and skipped. Returns the number of events
/// forwarded. Stops early once the agent side has gone away.
///
/// # Errors
///
/// Returns error if reading from `reader` fails.
pub async fn pump<R>(
    reader: R,
    samples: mpsc::Sender<RawSensorEvent>,
    fixes: mpsc::Sender<LocationFix>,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let delivered = match parse_line(line) {
            Ok(HostEvent::Sensor(event)) => samples.send(event).await.is_ok(),
            Ok(HostEvent::Location(fix)) => fixes.send(fix).await.is_ok(),
            Err(e) => {
                warn!("Skipping malformed host event: {}", e);
                continue;
            }
        };

        if !delivered {
            debug!("Agent no longer accepting events");
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}
