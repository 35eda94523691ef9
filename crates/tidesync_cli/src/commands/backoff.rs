//! Backoff command implementation.

use serde::Serialize;
use std::time::Duration;
use tidesync_engine::Backoff;

/// Delay range for one attempt.
#[derive(Debug, Serialize, PartialEq)]
pub struct BackoffRow {
    /// Attempt number, starting at 0.
    pub attempt: u32,
    /// Shortest possible delay in milliseconds.
    pub min_ms: u64,
    /// Longest possible delay in milliseconds.
    pub max_ms: u64,
    /// One random draw in milliseconds.
    pub sample_ms: u64,
}

/// Computes the delay table.
pub fn table(attempts: u32, backoff: &Backoff) -> Vec<BackoffRow> {
    (0..attempts)
        .map(|attempt| BackoffRow {
            attempt,
            min_ms: millis(backoff.delay_with(attempt, 0.0)),
            max_ms: millis(backoff.delay_with(attempt, 1.0)),
            sample_ms: millis(backoff.delay(attempt)),
        })
        .collect()
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Runs the backoff command.
pub fn run(
    attempts: u32,
    base_ms: u64,
    cap_ms: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let backoff = Backoff::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
    let rows = table(attempts, &backoff);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        "text" => {
            println!("{:>7}  {:>8}  {:>8}  {:>8}", "attempt", "min ms", "max ms", "sample");
            for row in &rows {
                println!(
                    "{:>7}  {:>8}  {:>8}  {:>8}",
                    row.attempt, row.min_ms, row.max_ms, row.sample_ms
                );
            }
        }
        other => return Err(format!("Unknown format: {other}").into()),
    }
    Ok(())
}
