//! Connector registry construction.
//!
//! Builds the [`ConnectorRegistry`] the orchestrator dispatches on, with
//! one connector per [`ProviderKind`] configured from `[connectors.*]`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tributary_core::connector::ConnectorRegistry;

use crate::config::Config;
use crate::connector_gcal::CalendarConnector;
use crate::connector_gdrive::DriveConnector;
use crate::connector_gmail::GmailConnector;
use crate::connector_slack::SlackConnector;

/// Register every built-in connector.
pub fn build_registry(config: &Config) -> Result<ConnectorRegistry> {
    let connectors = &config.connectors;
    let mut registry = ConnectorRegistry::new();

    registry.register(Arc::new(
        GmailConnector::new(connectors.gmail.clone()).context("gmail connector")?,
    ));
    registry.register(Arc::new(
        CalendarConnector::new(connectors.google_calendar.clone())
            .context("google_calendar connector")?,
    ));
    registry.register(Arc::new(
        DriveConnector::new(connectors.google_drive.clone()).context("google_drive connector")?,
    ));
    registry.register(Arc::new(
        SlackConnector::new(connectors.slack.clone()).context("slack connector")?,
    ));

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::models::ProviderKind;

    #[test]
    fn test_every_provider_is_registered() {
        let registry = build_registry(&Config::minimal("/tmp/unused.sqlite")).unwrap();
        assert_eq!(registry.kinds(), ProviderKind::ALL.to_vec());
        for kind in ProviderKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }
}
