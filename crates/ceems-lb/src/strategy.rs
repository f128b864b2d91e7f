//! Backend selection strategies

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The rule by which one alive backend is chosen per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Next index modulo pool size
    RoundRobin,
    /// Minimum in-flight connections, lowest index on ties
    LeastConnection,
    /// Backend whose retention covers the requested time window,
    /// longest retention on ties; round-robin when no window derivable
    ResourceBased,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round-robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            "least-connection" | "leastconnection" => Ok(Strategy::LeastConnection),
            "resource-based" | "resourcebased" => Ok(Strategy::ResourceBased),
            _ => Err(format!("Unknown load balancing strategy: {}", s)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::RoundRobin => write!(f, "round-robin"),
            Strategy::LeastConnection => write!(f, "least-connection"),
            Strategy::ResourceBased => write!(f, "resource-based"),
        }
    }
}

/// Requested time window of a query, as unix timestamps in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    /// How far back from now the window reaches; what a backend's
    /// retention must cover.
    pub fn lookback(&self) -> Duration {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        Duration::from_secs_f64((now - self.start).max(0.0))
    }
}

/// Extract `start`/`end` query parameters from a PromQL-style query
/// string. Returns `None` when no window is derivable, in which case
/// resource-based selection falls back to round-robin.
pub fn time_window_from_query(query: Option<&str>) -> Option<TimeWindow> {
    let query = query?;

    let mut start = None;
    let mut end = None;

    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };

        match key {
            "start" => start = value.parse::<f64>().ok(),
            "end" => end = value.parse::<f64>().ok(),
            _ => {}
        }
    }

    let start = start?;
    let end = end.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    });

    Some(TimeWindow { start, end })
}

/// Collect every occurrence of a query parameter, e.g. the repeated
/// `uuid` keys of a verification request.
pub fn query_params(query: Option<&str>, name: &str) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };

    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("round-robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("least-connection".parse::<Strategy>().unwrap(), Strategy::LeastConnection);
        assert_eq!("resource-based".parse::<Strategy>().unwrap(), Strategy::ResourceBased);
        assert!("fastest".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_strategy_roundtrip() {
        for strategy in [Strategy::RoundRobin, Strategy::LeastConnection, Strategy::ResourceBased] {
            assert_eq!(strategy.to_string().parse::<Strategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_window_extraction() {
        let window =
            time_window_from_query(Some("query=up&start=1700000000&end=1700003600")).unwrap();
        assert_eq!(window.start, 1_700_000_000.0);
        assert_eq!(window.end, 1_700_003_600.0);
    }

    #[test]
    fn test_window_end_defaults_to_now() {
        let window = time_window_from_query(Some("start=1700000000")).unwrap();
        assert_eq!(window.start, 1_700_000_000.0);
        assert!(window.end >= 1_700_000_000.0);
    }

    #[test]
    fn test_window_extraction_failures() {
        assert!(time_window_from_query(None).is_none());
        assert!(time_window_from_query(Some("query=up")).is_none());
        assert!(time_window_from_query(Some("start=yesterday")).is_none());
    }

    #[test]
    fn test_lookback() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();

        let window = TimeWindow { start: now - 3600.0, end: now };
        let lookback = window.lookback();
        assert!(lookback >= Duration::from_secs(3590) && lookback <= Duration::from_secs(3700));

        // A window starting in the future needs no retention
        let window = TimeWindow { start: now + 3600.0, end: now + 7200.0 };
        assert_eq!(window.lookback(), Duration::ZERO);
    }

    #[test]
    fn test_query_params() {
        let uuids = query_params(Some("uuid=100&uuid=200&project=acc1"), "uuid");
        assert_eq!(uuids, vec!["100", "200"]);

        assert!(query_params(None, "uuid").is_empty());
        assert!(query_params(Some("a=b"), "uuid").is_empty());
    }
}
