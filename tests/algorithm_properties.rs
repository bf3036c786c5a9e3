use quotaguard::algorithm::{self, AlgorithmState};
use quotaguard::{AlgorithmKind, LimiterConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Duration;

const WINDOW_MS: u64 = 1_000;

fn sliding(requests: u64) -> LimiterConfig {
    LimiterConfig::sliding_window("sw", requests, Duration::from_millis(WINDOW_MS)).unwrap()
}

/// Drive `config` with one request at every timestamp, returning admitted timestamps.
fn drive(config: &LimiterConfig, times: impl IntoIterator<Item = u64>) -> Vec<u64> {
    let mut state: Option<AlgorithmState> = None;
    let mut admitted = Vec::new();
    for now in times {
        let transition = algorithm::apply(state.as_ref(), 1, now, config);
        if transition.allowed {
            admitted.push(now);
        }
        state = Some(transition.state);
    }
    admitted
}

fn per_aligned_window(admitted: &[u64]) -> BTreeMap<u64, u64> {
    let mut counts = BTreeMap::new();
    for t in admitted {
        *counts.entry(t / WINDOW_MS).or_insert(0) += 1;
    }
    counts
}

#[test]
fn sliding_window_bounds_hold_for_constant_rates() {
    let config = sliding(10);
    for step in [1, 7, 33, 100, 250, 999, 1_001, 1_300, 2_500] {
        let admitted = drive(&config, (0..20_000).step_by(step as usize));

        for (window, count) in per_aligned_window(&admitted) {
            assert!(count <= 10, "step {step}: window {window} admitted {count}");
        }
        // Any interval of one window length overlaps at most two aligned windows.
        for (i, start) in admitted.iter().enumerate() {
            let in_interval =
                admitted[i..].iter().take_while(|t| **t < start + WINDOW_MS).count();
            assert!(in_interval <= 20, "step {step}: {in_interval} admitted after {start}");
        }
    }
}

#[test]
fn sliding_window_admits_everything_below_the_rate() {
    // One request every 250ms is four per window against a limit of ten.
    let config = sliding(10);
    let times: Vec<u64> = (0..10_000).step_by(250).collect();
    assert_eq!(drive(&config, times.clone()), times);
}

#[test]
fn sliding_window_bounds_hold_for_random_arrivals() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let config = sliding(25);
    let mut now = 0u64;
    let times: Vec<u64> = (0..50_000)
        .map(|_| {
            now += rng.random_range(0..40);
            now
        })
        .collect();

    let admitted = drive(&config, times);
    assert!(!admitted.is_empty());
    for (window, count) in per_aligned_window(&admitted) {
        assert!(count <= 25, "window {window} admitted {count}");
    }
}

#[test]
fn token_bucket_conserves_tokens() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..20 {
        let capacity = rng.random_range(1..50u64);
        let per_sec = rng.random_range(0.5..20.0f64);
        let config = LimiterConfig::builder("tb", AlgorithmKind::TokenBucket)
            .requests(capacity)
            .window(Duration::from_secs(1))
            .capacity(capacity)
            .refill_rate(per_sec)
            .build()
            .unwrap();

        let mut state: Option<AlgorithmState> = None;
        let mut now = 0u64;
        let mut admitted = 0u64;
        for _ in 0..2_000 {
            now += rng.random_range(0..100);
            let permits = rng.random_range(1..=3u64);
            let transition = algorithm::apply(state.as_ref(), permits, now, &config);
            if transition.allowed {
                admitted += permits;
            }
            match transition.state {
                AlgorithmState::TokenBucket(s) => {
                    assert!(s.tokens >= 0.0 && s.tokens <= capacity as f64);
                    assert_eq!(s.last_refill, now);
                }
                other => panic!("unexpected state {other:?}"),
            }
            state = Some(transition.state);
        }

        // Never more than the initial burst plus what has been refilled since.
        let refilled = per_sec * now as f64 / 1_000.0;
        assert!(
            admitted as f64 <= capacity as f64 + refilled + 1e-6,
            "admitted {admitted} > {capacity} + {refilled}"
        );
    }
}

#[test]
fn token_bucket_ignores_clock_going_backwards() {
    let config = LimiterConfig::token_bucket("tb", 2, Duration::from_secs(1)).unwrap();
    let first = algorithm::apply(None, 2, 10_000, &config);
    assert!(first.allowed);

    // A skewed caller reports an earlier time: nothing refills, nothing rewinds.
    let skewed = algorithm::apply(Some(&first.state), 1, 9_000, &config);
    assert!(!skewed.allowed);
    match skewed.state {
        AlgorithmState::TokenBucket(s) => assert_eq!(s.last_refill, 10_000),
        other => panic!("unexpected state {other:?}"),
    }

    // And the interval 9s..10s is not credited once time catches up.
    let later = algorithm::apply(Some(&skewed.state), 1, 10_400, &config);
    assert!(!later.allowed);
}

#[test]
fn updating_every_call_keeps_one_consistent_state() {
    // Feeding back every transition, allowed or not, must not leak capacity.
    let config = LimiterConfig::token_bucket("tb", 5, Duration::from_secs(5)).unwrap();
    let mut state: Option<AlgorithmState> = None;
    let mut admitted = 0;
    for i in 0..100u64 {
        let transition = algorithm::apply(state.as_ref(), 1, i * 10, &config);
        admitted += u64::from(transition.allowed);
        state = Some(transition.state);
    }
    // 5 up front plus one token per second over ~1s.
    assert!((5..=6).contains(&admitted), "admitted {admitted}");
}
