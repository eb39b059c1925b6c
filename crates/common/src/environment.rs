//! Market data endpoint configuration.

use std::fmt;
use std::str::FromStr;

/// Production market data websocket.
pub const PRODUCTION_WS_URL: &str = "wss://api.deversifi.com/market-data/ws";

/// Where the order book feed connects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MarketDataEndpoint {
    #[default]
    Production,
    /// Explicit `ws://` or `wss://` URL, e.g. a local relay or a test server.
    Custom(String),
}

impl MarketDataEndpoint {
    pub fn ws_url(&self) -> &str {
        match self {
            Self::Production => PRODUCTION_WS_URL,
            Self::Custom(url) => url,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Load the endpoint from the `DVF_ENDPOINT` env var.
    ///
    /// Returns `Production` if not set or invalid.
    pub fn from_env() -> Self {
        std::env::var("DVF_ENDPOINT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

impl fmt::Display for MarketDataEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Custom(url) => write!(f, "{}", url),
        }
    }
}

impl FromStr for MarketDataEndpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "production" | "prod" | "mainnet" => Ok(Self::Production),
            lower if lower.starts_with("ws://") || lower.starts_with("wss://") => {
                Ok(Self::Custom(trimmed.to_string()))
            }
            _ => Err(ParseEndpointError(s.to_string())),
        }
    }
}

/// Error parsing an endpoint string.
#[derive(Debug, Clone)]
pub struct ParseEndpointError(String);

impl fmt::Display for ParseEndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid endpoint '{}', expected 'production' or a ws:// / wss:// URL",
            self.0
        )
    }
}

impl std::error::Error for ParseEndpointError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_url() {
        let endpoint = MarketDataEndpoint::Production;
        assert_eq!(endpoint.ws_url(), "wss://api.deversifi.com/market-data/ws");
        assert!(endpoint.is_production());
    }

    #[test]
    fn test_parse_production_aliases() {
        for alias in ["production", "PROD", "mainnet"] {
            assert_eq!(
                alias.parse::<MarketDataEndpoint>().unwrap(),
                MarketDataEndpoint::Production
            );
        }
    }

    #[test]
    fn test_parse_custom_url() {
        let endpoint: MarketDataEndpoint = "ws://127.0.0.1:9001/ws".parse().unwrap();
        assert_eq!(endpoint.ws_url(), "ws://127.0.0.1:9001/ws");
        assert!(!endpoint.is_production());
    }

    #[test]
    fn test_parse_invalid() {
        assert!("http://example.com".parse::<MarketDataEndpoint>().is_err());
        assert!("staging".parse::<MarketDataEndpoint>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(MarketDataEndpoint::Production.to_string(), "production");
        assert_eq!(
            MarketDataEndpoint::Custom("wss://relay.local/ws".into()).to_string(),
            "wss://relay.local/ws"
        );
    }
}
