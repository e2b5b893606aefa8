//! Transport probing for instrument identification

use crate::config::{BenchConfig, DiscoveryConfig, TransportConfig};
use crate::hardware::registry::IDENTITY_PROBES;
use crate::transport::{TransportBackend, TransportError, TransportKind, TransportSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Pause between identification attempts
const RETRY_DELAY_MS: u64 = 100;

/// A successful identification exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    /// Identification text (`*IDN?` response or synthesized from an identity probe)
    pub text: String,
    /// Baud rate that answered, for serial devices
    pub baud_rate: Option<u32>,
}

/// Result of probing one address, retries included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The device answered.
    Identified(Identification),
    /// Every attempt failed.
    Unresponsive {
        /// Last failure
        reason: String,
        /// Attempts made
        attempts: u32,
    },
}

/// Enumerates addresses and runs identification exchanges.
#[derive(Clone)]
pub struct TransportProbe {
    backend: Arc<dyn TransportBackend>,
    transport: TransportConfig,
    discovery: DiscoveryConfig,
}

impl TransportProbe {
    /// Probe over `backend` with the timeouts and retry policy in `config`.
    pub fn new(backend: Arc<dyn TransportBackend>, config: &BenchConfig) -> Self {
        Self {
            backend,
            transport: config.transport.clone(),
            discovery: config.discovery.clone(),
        }
    }

    /// Whether the backend can reach a transport kind at all.
    pub fn supports(&self, kind: TransportKind) -> bool {
        self.backend.supports(kind)
    }

    /// Raw addresses present on a transport.
    pub async fn enumerate(&self, kind: TransportKind) -> Result<Vec<String>, TransportError> {
        let addresses = self.backend.enumerate(kind).await?;
        trace!(kind = %kind, count = addresses.len(), "Enumerated");
        Ok(addresses)
    }

    /// Whether an address matches a configured skip pattern.
    pub fn is_skipped(&self, address: &str) -> bool {
        let address = address.to_ascii_lowercase();
        self.discovery
            .skip_patterns
            .iter()
            .any(|pattern| address.contains(&pattern.to_ascii_lowercase()))
    }

    /// One identification exchange, without retries.
    ///
    /// Serial devices are tried at each configured baud rate, then with the
    /// registry's identity probes for devices that ignore `*IDN?`.
    pub async fn identify(
        &self,
        address: &str,
        kind: TransportKind,
    ) -> Result<Identification, TransportError> {
        if kind != TransportKind::Serial {
            let text = self.exchange(kind, address, "*IDN?", "\n", None).await?;
            return Ok(Identification {
                text,
                baud_rate: None,
            });
        }

        let mut last_error = TransportError::NotConnected;
        for &baud in &self.transport.serial_baud_rates {
            match self.exchange(kind, address, "*IDN?", "\n", Some(baud)).await {
                Ok(text) => {
                    return Ok(Identification {
                        text,
                        baud_rate: Some(baud),
                    })
                }
                Err(e) => {
                    trace!(address, baud, error = %e, "No *IDN? answer");
                    last_error = e;
                }
            }
        }

        for probe in IDENTITY_PROBES {
            for &baud in &self.transport.serial_baud_rates {
                let response = match self
                    .exchange(kind, address, probe.query, probe.write_termination, Some(baud))
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        last_error = e;
                        continue;
                    }
                };
                if response
                    .to_ascii_lowercase()
                    .starts_with(&probe.expect_prefix.to_ascii_lowercase())
                {
                    debug!(address, baud, query = probe.query, "Identity probe matched");
                    return Ok(Identification {
                        text: probe.identification.replace("{response}", &response),
                        baud_rate: Some(baud),
                    });
                }
            }
        }
        Err(last_error)
    }

    /// Identify with the configured number of retries.
    pub async fn probe(&self, address: &str, kind: TransportKind) -> ProbeOutcome {
        let attempts = self.discovery.probe_retries.saturating_add(1);
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match self.identify(address, kind).await {
                Ok(identification) => return ProbeOutcome::Identified(identification),
                Err(e) => {
                    debug!(address, kind = %kind, attempt, error = %e, "Identification failed");
                    reason = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
        }
        ProbeOutcome::Unresponsive { reason, attempts }
    }

    /// Open, send one query, close.
    async fn exchange(
        &self,
        kind: TransportKind,
        address: &str,
        query: &str,
        termination: &str,
        baud_rate: Option<u32>,
    ) -> Result<String, TransportError> {
        let timeout = self.transport.timeout_for(kind);
        let mut settings = TransportSettings::new(timeout).with_write_termination(termination);
        if let Some(baud) = baud_rate {
            settings = settings.with_baud_rate(baud);
        }

        let mut transport = self.backend.open(kind, address, &settings).await?;
        let result = match tokio::time::timeout(timeout, transport.query(query)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };
        if let Err(e) = transport.close().await {
            trace!(address, error = %e, "Close after probe failed");
        }

        let response = result?.trim().to_string();
        if response.is_empty() {
            return Err(TransportError::ReadFailed("empty response".to_string()));
        }
        Ok(response)
    }
}
