//! Single round-trip clock offset estimation.
//!
//! The receiver sends `SingleTimeSync{t0}`, the sender echoes it with its own
//! reply time, and the receiver stamps the arrival `t3`. The offset is half of
//! the round trip minus the sender's turnaround. Turnaround is taken as zero
//! unless measured turnaround is enabled and the sender reported its receive
//! time. One sample, symmetric delay assumed.

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::protocol::{FrameMessage, WireMessage};
use crate::transport::{Transport, TransportError};

/// Estimated sender-to-receiver clock offset, fixed for the session
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClockOffset {
    millis: f64,
}

impl ClockOffset {
    pub fn from_millis(millis: f64) -> Self {
        Self { millis }
    }

    pub fn millis(&self) -> f64 {
        self.millis
    }

    /// `received − (captured + offset)` in milliseconds
    pub fn one_way_delay_ms(&self, captured: DateTime<Utc>, received: DateTime<Utc>) -> f64 {
        millis_between(captured, received) - self.millis
    }
}

/// ISO-8601 / RFC 3339 UTC timestamp with millisecond precision
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1000.0,
        None => delta.num_milliseconds() as f64,
    }
}

/// `((t3 − t0) − turnaround) / 2`
pub fn estimate_offset_ms(t0: DateTime<Utc>, t3: DateTime<Utc>, turnaround_ms: f64) -> f64 {
    (millis_between(t0, t3) - turnaround_ms) / 2.0
}

/// Build the sender's reply to a sync request
pub fn sync_response(request_tx_time: String, received_at: DateTime<Utc>) -> WireMessage {
    WireMessage::TimeSyncResponse {
        request_tx_time,
        response_tx_time: format_timestamp(Utc::now()),
        response_rx_time: Some(format_timestamp(received_at)),
    }
}

/// Sender side: wait up to `wait` for one sync request and answer it.
///
/// Returns whether a request was answered. Other message types are ignored.
pub async fn respond<T: Transport>(transport: &mut T, wait: Duration) -> Result<bool> {
    if wait.is_zero() {
        return Ok(false);
    }
    let deadline = Instant::now() + wait;

    loop {
        let text = match timeout_at(deadline, transport.recv()).await {
            Err(_) => return Ok(false),
            Ok(Ok(Some(text))) => text,
            Ok(Ok(None)) => return Err(TransportError::Closed.into()),
            Ok(Err(e)) => return Err(e.into()),
        };
        let received_at = Utc::now();

        match WireMessage::parse(&text) {
            Ok(WireMessage::TimeSyncRequest { request_tx_time }) => {
                let reply = sync_response(request_tx_time, received_at);
                transport.send(reply.to_json()?).await?;
                debug!("Answered clock sync request");
                return Ok(true);
            }
            Ok(_) => continue,
            Err(e) => debug!("Ignoring message while waiting for sync: {}", e),
        }
    }
}

/// Receiver-side sync parameters
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Give up after this long without a response
    pub idle_timeout: Duration,
    /// Re-send the request this often until answered
    pub retry_interval: Duration,
    /// Subtract the sender's reported turnaround instead of assuming zero
    pub measure_turnaround: bool,
}

/// How the sync phase ended
#[derive(Debug)]
pub enum SyncOutcome {
    Synced(ClockOffset),
    /// Frames arrived before any sync reply; carries the first one
    Unsynced(Box<FrameMessage>),
    IdleTimeout,
    Closed,
}

/// Receiver side: run the sync exchange and produce the offset estimate.
///
/// The relay drops messages while no other peer is connected, so the request
/// is repeated every `retry_interval`; each reply is matched to the request it
/// echoes.
pub async fn synchronize<T: Transport>(
    transport: &mut T,
    settings: &SyncSettings,
) -> Result<SyncOutcome> {
    let deadline = Instant::now() + settings.idle_timeout;
    let mut pending: Vec<(String, DateTime<Utc>)> = Vec::new();

    loop {
        let t0 = Utc::now();
        let stamp = format_timestamp(t0);
        let request = WireMessage::TimeSyncRequest { request_tx_time: stamp.clone() };
        transport.send(request.to_json()?).await?;
        pending.push((stamp, t0));

        let retry_at = (Instant::now() + settings.retry_interval).min(deadline);
        loop {
            let text = match timeout_at(retry_at, transport.recv()).await {
                Err(_) => {
                    if Instant::now() >= deadline {
                        return Ok(SyncOutcome::IdleTimeout);
                    }
                    break;
                }
                Ok(Ok(Some(text))) => text,
                Ok(Ok(None)) => return Ok(SyncOutcome::Closed),
                Ok(Err(e)) => return Err(e.into()),
            };
            let t3 = Utc::now();

            match WireMessage::parse(&text) {
                Ok(WireMessage::TimeSyncResponse {
                    request_tx_time,
                    response_tx_time,
                    response_rx_time,
                }) => {
                    let Some((_, t0)) = pending.iter().find(|(sent, _)| *sent == request_tx_time) else {
                        debug!("Ignoring sync response for unknown request {}", request_tx_time);
                        continue;
                    };
                    let turnaround = if settings.measure_turnaround {
                        turnaround_ms(&response_rx_time, &response_tx_time)
                    } else {
                        0.0
                    };
                    let offset = ClockOffset::from_millis(estimate_offset_ms(*t0, t3, turnaround));
                    info!(
                        "⏱️  Clock offset {:.3} ms (round trip {:.3} ms, {} request(s))",
                        offset.millis(),
                        millis_between(*t0, t3),
                        pending.len()
                    );
                    return Ok(SyncOutcome::Synced(offset));
                }
                Ok(WireMessage::Frame(frame)) => return Ok(SyncOutcome::Unsynced(Box::new(frame))),
                Ok(_) => {}
                Err(e) => debug!("Ignoring message during sync: {}", e),
            }
        }
    }
}

fn turnaround_ms(rx: &Option<String>, tx: &str) -> f64 {
    let Some(rx) = rx else {
        return 0.0;
    };
    match (parse_timestamp(rx), parse_timestamp(tx)) {
        (Ok(rx), Ok(tx)) => millis_between(rx, tx).max(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use chrono::TimeDelta;

    fn settings() -> SyncSettings {
        SyncSettings {
            idle_timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(100),
            measure_turnaround: false,
        }
    }

    #[test]
    fn test_estimate_formula() {
        let t0 = Utc::now();
        assert_eq!(estimate_offset_ms(t0, t0, 0.0), 0.0);
        assert_eq!(estimate_offset_ms(t0, t0 + TimeDelta::milliseconds(40), 0.0), 20.0);
        assert_eq!(estimate_offset_ms(t0, t0 + TimeDelta::milliseconds(40), 10.0), 15.0);
    }

    #[test]
    fn test_delay_applies_offset() {
        let captured = Utc::now();
        let received = captured + TimeDelta::milliseconds(25);
        let offset = ClockOffset::from_millis(5.0);
        assert_eq!(offset.one_way_delay_ms(captured, received), 20.0);
        assert_eq!(ClockOffset::default().one_way_delay_ms(captured, received), 25.0);
    }

    #[test]
    fn test_timestamp_format() {
        let stamp = format_timestamp(Utc::now());
        assert!(stamp.ends_with('Z'));
        assert_eq!(stamp.split('.').nth(1).map(str::len), Some(4)); // "123Z"
        assert!(parse_timestamp(&stamp).is_ok());
        assert!(parse_timestamp("2026-10-18 10:00:00").is_err());
    }

    #[tokio::test]
    async fn test_zero_delay_sync_is_near_zero() {
        let (mut receiver, mut sender) = memory::pair();

        let responder = tokio::spawn(async move {
            let answered = respond(&mut sender, Duration::from_secs(2)).await.unwrap();
            (answered, sender)
        });

        let outcome = synchronize(&mut receiver, &settings()).await.unwrap();
        let (answered, _sender) = responder.await.unwrap();
        assert!(answered);

        match outcome {
            SyncOutcome::Synced(offset) => assert!(offset.millis().abs() < 5.0, "offset {}", offset.millis()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_measured_turnaround() {
        let (mut receiver, mut sender) = memory::pair();

        tokio::spawn(async move {
            let text = sender.recv().await.unwrap().unwrap();
            let WireMessage::TimeSyncRequest { request_tx_time } = WireMessage::parse(&text).unwrap() else {
                panic!("expected sync request");
            };
            let received_at = Utc::now();
            tokio::time::sleep(Duration::from_millis(60)).await;
            let reply = sync_response(request_tx_time, received_at);
            sender.send(reply.to_json().unwrap()).await.unwrap();
            sender
        });

        let measured = SyncSettings { measure_turnaround: true, ..settings() };
        match synchronize(&mut receiver, &measured).await.unwrap() {
            SyncOutcome::Synced(offset) => assert!(offset.millis().abs() < 10.0, "offset {}", offset.millis()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sync_times_out_without_peer() {
        let (mut receiver, _sender) = memory::pair();
        let quick = SyncSettings { idle_timeout: Duration::from_millis(300), ..settings() };

        let outcome = synchronize(&mut receiver, &quick).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::IdleTimeout));
    }

    #[tokio::test]
    async fn test_stale_response_is_ignored() {
        let (mut receiver, mut sender) = memory::pair();

        tokio::spawn(async move {
            let stale = WireMessage::TimeSyncResponse {
                request_tx_time: "2000-01-01T00:00:00.000Z".to_string(),
                response_tx_time: format_timestamp(Utc::now()),
                response_rx_time: None,
            };
            sender.send(stale.to_json().unwrap()).await.unwrap();
            respond(&mut sender, Duration::from_secs(2)).await.unwrap();
            sender
        });

        let outcome = synchronize(&mut receiver, &settings()).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced(_)));
    }

    #[tokio::test]
    async fn test_frame_before_reply_falls_back() {
        let (mut receiver, mut sender) = memory::pair();
        sender.send(r#"{"type":"test","setup_description":"","frame_id":1,"filename":"a.jpg",
            "timestamp":"2026-10-18T10:00:00.000Z","resolution":"8x8","jpeg_quality":50,
            "size_kb":1.0,"compression_time_ms":1.0,"encryption_time_ms":1.0,"data":""}"#.to_string())
            .await
            .unwrap();

        match synchronize(&mut receiver, &settings()).await.unwrap() {
            SyncOutcome::Unsynced(frame) => assert_eq!(frame.frame_id, 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
