//! Resource-pressure circuit breakers

use modelplane_core::{CircuitBreakerConfig, ModelPlaneError, ModelPlaneResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// A guard that opens under resource pressure
pub trait CircuitBreaker: Send + Sync {
    fn name(&self) -> &str;

    /// Whether new work must be rejected
    fn is_open(&self) -> bool;
}

/// Opens when used memory exceeds a percentage of total memory
pub struct MemoryCircuitBreaker {
    threshold_percent: f64,
    meminfo_path: PathBuf,
}

impl MemoryCircuitBreaker {
    pub fn new(threshold_percent: f64) -> Self {
        Self {
            threshold_percent,
            meminfo_path: PathBuf::from("/proc/meminfo"),
        }
    }

    /// Read memory figures from another file in `/proc/meminfo` format
    pub fn with_meminfo_path(mut self, path: PathBuf) -> Self {
        self.meminfo_path = path;
        self
    }

    /// Current memory usage in percent; `None` when unavailable
    pub fn usage_percent(&self) -> Option<f64> {
        let content = std::fs::read_to_string(&self.meminfo_path).ok()?;
        parse_meminfo(&content)
    }
}

/// Used-memory percentage from `MemTotal` and `MemAvailable`
fn parse_meminfo(content: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        content
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|value| value.parse().ok())
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    if total <= 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}

impl CircuitBreaker for MemoryCircuitBreaker {
    fn name(&self) -> &str {
        "Memory Circuit Breaker"
    }

    fn is_open(&self) -> bool {
        match self.usage_percent() {
            Some(usage) => {
                debug!(usage = usage, threshold = self.threshold_percent, "Memory usage");
                usage > self.threshold_percent
            }
            // Unknown pressure never blocks work
            None => false,
        }
    }
}

/// Every breaker consulted before admitting heavy work
pub struct CircuitBreakerService {
    enabled: bool,
    breakers: Vec<Arc<dyn CircuitBreaker>>,
}

impl CircuitBreakerService {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        let mut service = Self::empty(config.enabled);
        service.add(Arc::new(MemoryCircuitBreaker::new(
            config.memory_threshold_percent,
        )));
        service
    }

    /// A service with no breakers registered
    pub fn empty(enabled: bool) -> Self {
        Self {
            enabled,
            breakers: Vec::new(),
        }
    }

    pub fn add(&mut self, breaker: Arc<dyn CircuitBreaker>) {
        self.breakers.push(breaker);
    }

    /// Name of the first open breaker
    pub fn open_breaker(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.breakers
            .iter()
            .find(|b| b.is_open())
            .map(|b| b.name())
    }

    /// Fail with `LimitExceeded` when any breaker is open
    pub fn ensure_closed(&self) -> ModelPlaneResult<()> {
        match self.open_breaker() {
            Some(name) => {
                warn!(breaker = name, "Circuit breaker is open");
                Err(ModelPlaneError::limit_exceeded(format!(
                    "{} is open, please check your resources!",
                    name
                )))
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct FixedBreaker(bool);

    impl CircuitBreaker for FixedBreaker {
        fn name(&self) -> &str {
            "Fixed Circuit Breaker"
        }

        fn is_open(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16000000 kB\nMemFree:  1000 kB\nMemAvailable:    4000000 kB\n";
        assert_eq!(parse_meminfo(content), Some(75.0));
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn test_memory_breaker_threshold() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MemTotal: 1000 kB\nMemAvailable: 100 kB").unwrap();

        let open = MemoryCircuitBreaker::new(85.0).with_meminfo_path(file.path().to_path_buf());
        assert!(open.is_open());

        let closed = MemoryCircuitBreaker::new(95.0).with_meminfo_path(file.path().to_path_buf());
        assert!(!closed.is_open());

        let unknown = MemoryCircuitBreaker::new(1.0).with_meminfo_path("/nonexistent".into());
        assert!(!unknown.is_open());
    }

    #[test]
    fn test_service() {
        let mut service = CircuitBreakerService::empty(true);
        assert!(service.ensure_closed().is_ok());

        service.add(Arc::new(FixedBreaker(false)));
        service.add(Arc::new(FixedBreaker(true)));
        let err = service.ensure_closed().unwrap_err();
        assert!(matches!(err, ModelPlaneError::LimitExceeded(_)));

        let mut disabled = CircuitBreakerService::empty(false);
        disabled.add(Arc::new(FixedBreaker(true)));
        assert!(disabled.ensure_closed().is_ok());
    }
}
