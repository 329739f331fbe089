// Copyright 2021 rexc project contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-process metric accumulation, flushed once at the end of the
//! invocation in StatsD line format.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::errors::*;

#[derive(Debug, Default)]
pub struct Metrics {
    counters: BTreeMap<String, i64>,
    durations: BTreeMap<String, Duration>,
}

impl Metrics {
    pub fn add_counter(&mut self, name: &str, value: i64) {
        *self.counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub fn record_duration(&mut self, name: &str, elapsed: Duration) {
        *self
            .durations
            .entry(name.to_string())
            .or_insert(Duration::ZERO) += elapsed;
    }

    pub fn counters(&self) -> &BTreeMap<String, i64> {
        &self.counters
    }

    pub fn durations(&self) -> &BTreeMap<String, Duration> {
        &self.durations
    }

    /// StatsD lines: `name:value|c` for counters, `name:millis|ms` for
    /// durations.
    fn statsd_lines(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.counters {
            out.push_str(&format!("{}:{}|c\n", name, value));
        }
        for (name, duration) in &self.durations {
            out.push_str(&format!("{}:{}|ms\n", name, duration.as_millis()));
        }
        out
    }
}

#[derive(Debug)]
enum Sink {
    Stderr,
    File(PathBuf),
    Udp(String),
}

/// Flushes the accumulated metrics when dropped, so every exit path
/// publishes. Publishing failures are only ever warnings.
pub struct PublisherGuard {
    metrics: Arc<Mutex<Metrics>>,
    sink: Option<Sink>,
}

impl PublisherGuard {
    pub fn new(config: &Config, metrics: Arc<Mutex<Metrics>>) -> PublisherGuard {
        let sink = if !config.enable_metrics {
            None
        } else if let Some(path) = &config.metrics_file {
            Some(Sink::File(path.clone()))
        } else if let Some(server) = &config.metrics_udp_server {
            Some(Sink::Udp(server.clone()))
        } else {
            Some(Sink::Stderr)
        };
        PublisherGuard { metrics, sink }
    }

    fn publish(&self) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let lines = match self.metrics.lock() {
            Ok(metrics) => metrics.statsd_lines(),
            Err(poisoned) => poisoned.into_inner().statsd_lines(),
        };
        if lines.is_empty() {
            return Ok(());
        }
        match sink {
            Sink::Stderr => {
                std::io::stderr().write_all(lines.as_bytes())?;
            }
            Sink::File(path) => {
                let mut file = fs_err::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                file.write_all(lines.as_bytes())?;
            }
            Sink::Udp(server) => {
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                for line in lines.lines() {
                    socket.send_to(line.as_bytes(), server.as_str())?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for PublisherGuard {
    fn drop(&mut self) {
        if let Err(e) = self.publish() {
            warn!("failed to publish metrics: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut metrics = Metrics::default();
        metrics.add_counter("rexc.action_cache_hit", 1);
        metrics.add_counter("rexc.action_cache_hit", 2);
        assert_eq!(metrics.counters()["rexc.action_cache_hit"], 3);
    }

    #[test]
    fn durations_accumulate() {
        let mut metrics = Metrics::default();
        metrics.record_duration("rexc.execute_action", Duration::from_millis(5));
        metrics.record_duration("rexc.execute_action", Duration::from_millis(7));
        assert_eq!(
            metrics.durations()["rexc.execute_action"],
            Duration::from_millis(12)
        );
    }

    #[test]
    fn statsd_format() {
        let mut metrics = Metrics::default();
        metrics.add_counter("rexc.input_size_bytes", 42);
        metrics.record_duration("rexc.download_blobs", Duration::from_millis(1500));
        let lines = metrics.statsd_lines();
        assert!(lines.contains("rexc.input_size_bytes:42|c\n"));
        assert!(lines.contains("rexc.download_blobs:1500|ms\n"));
    }

    #[test]
    fn guard_writes_to_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.out");

        let mut config = Config::default();
        config.enable_metrics = true;
        config.metrics_file = Some(path.clone());

        let metrics = Arc::new(Mutex::new(Metrics::default()));
        metrics
            .lock()
            .unwrap()
            .add_counter("rexc.action_cache_miss", 1);
        drop(PublisherGuard::new(&config, metrics));

        let contents = fs_err::read_to_string(&path).unwrap();
        assert_eq!(contents, "rexc.action_cache_miss:1|c\n");
    }

    #[test]
    fn disabled_metrics_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.out");
        let mut config = Config::default();
        config.metrics_file = Some(path.clone());

        let metrics = Arc::new(Mutex::new(Metrics::default()));
        metrics.lock().unwrap().add_counter("rexc.some_counter", 1);
        drop(PublisherGuard::new(&config, metrics));
        assert!(!path.exists());
    }
}
