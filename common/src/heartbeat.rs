use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::HeartbeatConfig,
    types::{HeartbeatPhase, HeartbeatResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub token: u32,
}

impl HeartbeatPayload {
    pub fn encode(self) -> Vec<u8> {
        format!("{{\"token\":{}}}", self.token).into_bytes()
    }

    /// Accepts `{"token": n}` or a bare decimal token.
    pub fn decode(raw: &[u8]) -> Result<Self, AckError> {
        if let Ok(payload) = serde_json::from_slice::<HeartbeatPayload>(raw) {
            return Ok(payload);
        }
        let text = std::str::from_utf8(raw).map_err(|_| AckError::NotUtf8)?;
        text.trim()
            .parse::<u32>()
            .map(|token| Self { token })
            .map_err(|_| AckError::MissingToken(text.chars().take(64).collect()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    #[error("acknowledgement payload is not utf-8")]
    NotUtf8,
    #[error("acknowledgement carries no usable token: {0:?}")]
    MissingToken(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// A new cycle is armed; the caller publishes `payload`.
    Send { token: u32, payload: Vec<u8> },
    Missed { token: u32, consecutive: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted {
        token: u32,
        round_trip_ms: u64,
        recovered_from: u32,
    },
    Stale {
        token: u32,
    },
    /// Ack for a cycle that was still within its deadline but already
    /// replaced by a newer send. The peer answers slower than the send interval.
    Superseded {
        token: u32,
        current: u32,
    },
    Malformed(AckError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cycle {
    token: u32,
    sent_ms: u64,
    acknowledged: bool,
}

/// Correlated heartbeat protocol.
///
/// Sends go out on a fixed period while running. Every send opens a new cycle
/// with a fresh token and supersedes the previous one, so only the newest
/// token is ever accepted. Peers must therefore answer within the send
/// interval, not just the received interval. Each unanswered send keeps its
/// own deadline and yields exactly one miss when it passes; an accepted ack
/// settles all of them.
///
/// Tokens count up from 1 and wrap past `u32::MAX` back to 1; 0 is never sent.
#[derive(Debug, Clone)]
pub struct HeartbeatEngine {
    send_interval_ms: u64,
    received_interval_ms: u64,

    last_token: u32,
    current: Option<Cycle>,
    outstanding: VecDeque<(u32, u64)>,
    last_send_ms: Option<u64>,

    consecutive_misses: u32,
    last_result: HeartbeatResult,
    last_ack_ms: Option<u64>,
    sent_total: u64,
    acked_total: u64,
}

impl HeartbeatEngine {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            send_interval_ms: config.send_interval_ms,
            received_interval_ms: config.received_interval_ms,
            last_token: 0,
            current: None,
            outstanding: VecDeque::new(),
            last_send_ms: None,
            consecutive_misses: 0,
            last_result: HeartbeatResult::None,
            last_ack_ms: None,
            sent_total: 0,
            acked_total: 0,
        }
    }

    pub fn reconfigure(&mut self, config: &HeartbeatConfig) {
        self.send_interval_ms = config.send_interval_ms;
        self.received_interval_ms = config.received_interval_ms;
        self.reset();
    }

    /// Arms the send schedule; the first heartbeat goes out one send interval later.
    pub fn start(&mut self, now_ms: u64) {
        self.reset();
        self.last_send_ms = Some(now_ms);
    }

    /// Abandons the active cycle without recording a miss. The token counter
    /// is kept, so acks for the abandoned cycle stay stale.
    pub fn reset(&mut self) {
        self.current = None;
        self.outstanding.clear();
        self.last_send_ms = None;
    }

    pub fn is_running(&self) -> bool {
        self.last_send_ms.is_some()
    }

    pub fn phase(&self) -> HeartbeatPhase {
        if self.outstanding.is_empty() {
            HeartbeatPhase::Idle
        } else {
            HeartbeatPhase::AwaitingAck
        }
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    pub fn last_result(&self) -> HeartbeatResult {
        self.last_result
    }

    pub fn current_token(&self) -> Option<u32> {
        self.current.map(|cycle| cycle.token)
    }

    pub fn last_sent_ms(&self) -> Option<u64> {
        self.current.map(|cycle| cycle.sent_ms)
    }

    pub fn last_ack_ms(&self) -> Option<u64> {
        self.last_ack_ms
    }

    pub fn sent_total(&self) -> u64 {
        self.sent_total
    }

    pub fn acked_total(&self) -> u64 {
        self.acked_total
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<HeartbeatEvent> {
        let mut events = Vec::new();

        self.expire_deadlines(now_ms, &mut events);

        let send_due = self
            .last_send_ms
            .map(|last| now_ms.saturating_sub(last) >= self.send_interval_ms)
            .unwrap_or(false);
        if send_due {
            events.push(self.open_cycle(now_ms));
        }

        events
    }

    /// Sends a heartbeat now, outside the regular schedule.
    pub fn force(&mut self, now_ms: u64) -> Option<HeartbeatEvent> {
        if !self.is_running() {
            return None;
        }
        Some(self.open_cycle(now_ms))
    }

    pub fn on_ack(&mut self, payload: &[u8], now_ms: u64) -> AckOutcome {
        let token = match HeartbeatPayload::decode(payload) {
            Ok(decoded) => decoded.token,
            Err(err) => return AckOutcome::Malformed(err),
        };

        let Some(cycle) = self.current else {
            return AckOutcome::Stale { token };
        };
        if cycle.token != token {
            if self.outstanding.iter().any(|&(pending, _)| pending == token) {
                return AckOutcome::Superseded {
                    token,
                    current: cycle.token,
                };
            }
            return AckOutcome::Stale { token };
        }
        let round_trip_ms = now_ms.saturating_sub(cycle.sent_ms);
        if cycle.acknowledged || round_trip_ms >= self.received_interval_ms {
            return AckOutcome::Stale { token };
        }

        self.current = Some(Cycle {
            acknowledged: true,
            ..cycle
        });
        let recovered_from = self.consecutive_misses;

        self.outstanding.clear();
        self.consecutive_misses = 0;
        self.last_result = HeartbeatResult::Healthy;
        self.last_ack_ms = Some(now_ms);
        self.acked_total = self.acked_total.saturating_add(1);

        AckOutcome::Accepted {
            token,
            round_trip_ms,
            recovered_from,
        }
    }

    fn open_cycle(&mut self, now_ms: u64) -> HeartbeatEvent {
        self.last_token = self.last_token.wrapping_add(1).max(1);
        let token = self.last_token;

        self.current = Some(Cycle {
            token,
            sent_ms: now_ms,
            acknowledged: false,
        });
        self.outstanding.push_back((token, now_ms));
        self.last_send_ms = Some(now_ms);
        self.sent_total = self.sent_total.saturating_add(1);

        HeartbeatEvent::Send {
            token,
            payload: HeartbeatPayload { token }.encode(),
        }
    }

    fn expire_deadlines(&mut self, now_ms: u64, events: &mut Vec<HeartbeatEvent>) {
        while let Some(&(token, sent_ms)) = self.outstanding.front() {
            if now_ms.saturating_sub(sent_ms) < self.received_interval_ms {
                break;
            }
            self.outstanding.pop_front();
            self.consecutive_misses = self.consecutive_misses.saturating_add(1);
            self.last_result = HeartbeatResult::Missed;
            events.push(HeartbeatEvent::Missed {
                token,
                consecutive: self.consecutive_misses,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> HeartbeatEngine {
        HeartbeatEngine::new(&HeartbeatConfig::default())
    }

    fn sent_token(events: &[HeartbeatEvent]) -> Option<u32> {
        events.iter().find_map(|event| match event {
            HeartbeatEvent::Send { token, .. } => Some(*token),
            HeartbeatEvent::Missed { .. } => None,
        })
    }

    fn misses(events: &[HeartbeatEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|event| match event {
                HeartbeatEvent::Missed { consecutive, .. } => Some(*consecutive),
                HeartbeatEvent::Send { .. } => None,
            })
            .collect()
    }

    #[test]
    fn payload_accepts_json_and_decimal() {
        assert_eq!(
            HeartbeatPayload::decode(br#"{"token": 42}"#),
            Ok(HeartbeatPayload { token: 42 })
        );
        assert_eq!(
            HeartbeatPayload::decode(b" 17\n"),
            Ok(HeartbeatPayload { token: 17 })
        );
        assert_eq!(
            HeartbeatPayload::decode(b"pong"),
            Err(AckError::MissingToken("pong".to_string()))
        );
        assert_eq!(
            HeartbeatPayload::decode(&[0xff, 0xfe]),
            Err(AckError::NotUtf8)
        );
        assert_eq!(
            HeartbeatPayload::decode(&HeartbeatPayload { token: 9 }.encode()),
            Ok(HeartbeatPayload { token: 9 })
        );
    }

    #[test]
    fn idle_until_started() {
        let mut engine = engine();
        assert!(engine.tick(1_000_000).is_empty());
        assert!(engine.force(1_000_000).is_none());
    }

    #[test]
    fn first_send_one_interval_after_start() {
        let mut engine = engine();
        engine.start(0);

        assert!(engine.tick(59_999).is_empty());
        let events = engine.tick(60_000);
        assert_eq!(sent_token(&events), Some(1));
        assert_eq!(engine.phase(), HeartbeatPhase::AwaitingAck);
    }

    #[test]
    fn timely_ack_returns_to_idle() {
        let mut engine = engine();
        engine.start(0);
        let token = sent_token(&engine.tick(60_000)).unwrap();

        let outcome = engine.on_ack(token.to_string().as_bytes(), 65_000);
        assert_eq!(
            outcome,
            AckOutcome::Accepted {
                token,
                round_trip_ms: 5_000,
                recovered_from: 0,
            }
        );
        assert_eq!(engine.phase(), HeartbeatPhase::Idle);
        assert_eq!(engine.last_result(), HeartbeatResult::Healthy);

        // A duplicate delivery of the same ack changes nothing.
        assert_eq!(
            engine.on_ack(token.to_string().as_bytes(), 66_000),
            AckOutcome::Stale { token }
        );
        assert_eq!(engine.acked_total(), 1);
    }

    #[test]
    fn tokens_strictly_increase() {
        let mut engine = engine();
        engine.start(0);
        let mut previous = 0;
        for step in 1..=5 {
            let token = sent_token(&engine.tick(step * 60_000)).unwrap();
            assert!(token > previous);
            previous = token;
        }

        engine.reset();
        engine.start(400_000);
        let token = sent_token(&engine.tick(460_000)).unwrap();
        assert!(token > previous);
    }

    #[test]
    fn each_unanswered_send_misses_once() {
        let mut engine = engine();
        engine.start(0);

        let mut observed = Vec::new();
        for second in 1..=400 {
            for consecutive in misses(&engine.tick(second * 1_000)) {
                observed.push((second, consecutive));
            }
        }

        // Sends at 60, 120, 180, 240 ... each expires 130s later.
        assert_eq!(observed, vec![(190, 1), (250, 2), (310, 3), (370, 4)]);
    }

    #[test]
    fn stale_token_is_ignored() {
        let mut engine = engine();
        engine.start(0);
        let first = sent_token(&engine.tick(60_000)).unwrap();
        engine.tick(120_000);
        engine.tick(180_000);
        let misses_before = engine.consecutive_misses();
        let phase_before = engine.phase();

        // Still inside its own deadline, but two sends behind.
        assert_eq!(
            engine.on_ack(first.to_string().as_bytes(), 181_000),
            AckOutcome::Superseded {
                token: first,
                current: first + 2
            }
        );
        assert_eq!(engine.consecutive_misses(), misses_before);
        assert_eq!(engine.phase(), phase_before);
    }

    #[test]
    fn ack_after_misses_reports_recovery() {
        let mut engine = engine();
        engine.start(0);
        for second in 1..=310 {
            engine.tick(second * 1_000);
        }
        assert_eq!(engine.consecutive_misses(), 3);

        let token = engine.current_token().unwrap();
        match engine.on_ack(token.to_string().as_bytes(), 311_000) {
            AckOutcome::Accepted { recovered_from, .. } => assert_eq!(recovered_from, 3),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(engine.consecutive_misses(), 0);
        assert_eq!(engine.phase(), HeartbeatPhase::Idle);

        // Settled deadlines never produce late misses.
        assert!(misses(&engine.tick(370_000)).is_empty());
    }

    #[test]
    fn reset_drops_outstanding_without_miss() {
        let mut engine = engine();
        engine.start(0);
        let token = sent_token(&engine.tick(60_000)).unwrap();

        engine.reset();
        assert_eq!(engine.phase(), HeartbeatPhase::Idle);
        assert!(engine.tick(500_000).is_empty());
        assert_eq!(engine.consecutive_misses(), 0);
        assert_eq!(
            engine.on_ack(token.to_string().as_bytes(), 61_000),
            AckOutcome::Stale { token }
        );
    }

    #[test]
    fn malformed_ack_changes_nothing() {
        let mut engine = engine();
        engine.start(0);
        engine.tick(60_000);

        assert!(matches!(
            engine.on_ack(b"{\"tok\":1}", 61_000),
            AckOutcome::Malformed(_)
        ));
        assert_eq!(engine.phase(), HeartbeatPhase::AwaitingAck);
    }

    #[test]
    fn forced_send_supersedes_current_cycle() {
        let mut engine = engine();
        engine.start(0);
        let first = sent_token(&engine.tick(60_000)).unwrap();
        let forced = match engine.force(70_000) {
            Some(HeartbeatEvent::Send { token, .. }) => token,
            other => panic!("unexpected event {other:?}"),
        };

        assert!(forced > first);
        assert_eq!(
            engine.on_ack(first.to_string().as_bytes(), 71_000),
            AckOutcome::Superseded {
                token: first,
                current: forced
            }
        );
        assert!(matches!(
            engine.on_ack(forced.to_string().as_bytes(), 72_000),
            AckOutcome::Accepted { .. }
        ));
        // Next scheduled send counts from the forced one.
        assert!(sent_token(&engine.tick(129_999)).is_none());
        assert!(sent_token(&engine.tick(130_000)).is_some());
    }

    #[test]
    fn ack_slower_than_send_interval_is_superseded() {
        let mut engine = engine();
        engine.start(0);
        engine.tick(60_000);
        engine.tick(120_000);

        // Within the 130 s received interval, but token 2 is already out.
        assert_eq!(
            engine.on_ack(b"1", 125_000),
            AckOutcome::Superseded {
                token: 1,
                current: 2
            }
        );
        assert_eq!(misses(&engine.tick(190_000)), vec![1]);
        assert_eq!(engine.consecutive_misses(), 1);
    }

    #[test]
    fn token_wraps_past_max_and_skips_zero() {
        let mut engine = engine();
        engine.last_token = u32::MAX - 1;
        engine.start(0);

        assert_eq!(sent_token(&engine.tick(60_000)), Some(u32::MAX));
        assert_eq!(sent_token(&engine.tick(120_000)), Some(1));
        assert_eq!(engine.on_ack(b"0", 121_000), AckOutcome::Stale { token: 0 });
        assert_eq!(
            engine.on_ack(&format!("{}", u32::MAX).into_bytes(), 122_000),
            AckOutcome::Superseded {
                token: u32::MAX,
                current: 1
            }
        );
        assert!(matches!(
            engine.on_ack(b"1", 123_000),
            AckOutcome::Accepted { token: 1, .. }
        ));
    }
}
