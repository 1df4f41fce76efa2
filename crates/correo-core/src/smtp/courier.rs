//! Remote delivery courier
//!
//! Resolves the destination domain's MX records, consults the MTA-STS
//! policy cache, and hands the message to each acceptable MX in turn.

use crate::sts::{domain_to_ascii, Mode, Policy, PolicyCache};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use lettre::address::Envelope as SmtpEnvelope;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Deadline for looking up the destination's MTA-STS policy; a slow or
/// absent policy must not hold up delivery for long.
const STS_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// One message headed to one destination domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope sender (MAIL FROM)
    pub from: String,
    /// Destination domain; all recipients belong to it
    pub domain: String,
    /// Envelope recipients (RCPT TO)
    pub recipients: Vec<String>,
}

/// Message delivery, as a trait so the queue can be tested without a
/// network.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, envelope: &Envelope, message: &[u8]) -> Result<()>;
}

/// The set of MXs delivery may use, in preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPlan {
    pub targets: Vec<String>,
    /// Whether STARTTLS is mandatory (MTA-STS policy in enforce mode)
    pub tls_required: bool,
}

/// Apply an MTA-STS policy to a resolved MX list.
///
/// No policy means no constraints. With a policy, disallowed MXs are
/// dropped (which only happens in enforce mode) and TLS becomes mandatory
/// under enforce.
pub fn plan_targets(policy: Option<&Policy>, mxs: Vec<String>) -> DeliveryPlan {
    let Some(policy) = policy else {
        return DeliveryPlan {
            targets: mxs,
            tls_required: false,
        };
    };

    let targets = mxs
        .into_iter()
        .filter(|mx| {
            if policy.mx_is_allowed(mx) {
                true
            } else {
                warn!(mx = %mx, "MX not allowed by MTA-STS policy, skipping");
                false
            }
        })
        .collect();

    DeliveryPlan {
        targets,
        tls_required: policy.mode == Mode::Enforce,
    }
}

/// Remote SMTP courier.
pub struct Courier {
    hello_domain: String,
    resolver: TokioAsyncResolver,
    sts_cache: Arc<PolicyCache>,
    smtp_port: u16,
}

impl Courier {
    /// Create a courier that identifies itself as `hello_domain` and
    /// checks deliveries against the given policy cache.
    pub fn new(hello_domain: String, sts_cache: Arc<PolicyCache>) -> Self {
        Self {
            hello_domain,
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            sts_cache,
            smtp_port: 25,
        }
    }

    /// Set the remote SMTP port (testing seam)
    pub fn with_smtp_port(mut self, port: u16) -> Self {
        self.smtp_port = port;
        self
    }

    /// Resolve MX records for a domain, sorted by preference, falling
    /// back to the domain itself when there are none.
    pub async fn resolve_mx(&self, domain: &str) -> Result<Vec<String>> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx) => {
                let mut hosts: Vec<(u16, String)> = mx
                    .iter()
                    .map(|r| (r.preference(), r.exchange().to_string()))
                    .collect();

                // Lower preference is better.
                hosts.sort_by_key(|(pref, _)| *pref);

                Ok(hosts
                    .into_iter()
                    .map(|(_, host)| host.trim_end_matches('.').to_string())
                    .collect())
            }
            Err(e) => {
                warn!(
                    "No MX records for {}, falling back to A record: {}",
                    domain, e
                );
                Ok(vec![domain.to_string()])
            }
        }
    }

    /// Compute the delivery plan for a domain: resolved MXs with the
    /// MTA-STS policy applied.
    ///
    /// A policy fetch failure of any kind means delivery proceeds without
    /// MTA-STS constraints; the subsystem is one defense among several
    /// and its unavailability must not block mail.
    pub async fn delivery_plan(&self, domain: &str) -> Result<DeliveryPlan> {
        let mxs = self.resolve_mx(domain).await?;

        let policy = match tokio::time::timeout(STS_FETCH_TIMEOUT, self.sts_cache.fetch(domain))
            .await
        {
            Ok(Ok(p)) => Some(p),
            Ok(Err(e)) => {
                debug!(domain = %domain, error = %e, "no MTA-STS policy for delivery");
                None
            }
            Err(_) => {
                debug!(domain = %domain, "MTA-STS policy fetch timed out");
                None
            }
        };

        Ok(plan_targets(policy.as_ref(), mxs))
    }

    async fn attempt(
        &self,
        mx: &str,
        tls_required: bool,
        envelope: &SmtpEnvelope,
        message: &[u8],
    ) -> Result<()> {
        let builder = if tls_required {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(mx)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(mx)
                .tls(Tls::Opportunistic(TlsParameters::new(mx.to_string())?))
        };

        let transport = builder
            .port(self.smtp_port)
            .hello_name(ClientId::Domain(self.hello_domain.clone()))
            .build();

        transport.send_raw(envelope, message).await?;
        Ok(())
    }
}

#[async_trait]
impl Deliver for Courier {
    async fn deliver(&self, envelope: &Envelope, message: &[u8]) -> Result<()> {
        let domain = domain_to_ascii(&envelope.domain)?;
        let plan = self.delivery_plan(&domain).await?;

        if plan.targets.is_empty() {
            bail!("no MX allowed by the MTA-STS policy for {}", domain);
        }

        let smtp_envelope = smtp_envelope(envelope)?;

        let mut last_err = None;
        for mx in &plan.targets {
            debug!(domain = %domain, mx = %mx, tls_required = plan.tls_required, "attempting delivery");
            match self
                .attempt(mx, plan.tls_required, &smtp_envelope, message)
                .await
            {
                Ok(()) => {
                    info!(domain = %domain, mx = %mx, "message delivered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(domain = %domain, mx = %mx, error = %e, "delivery attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no MX candidates for {}", domain)))
    }
}

fn smtp_envelope(envelope: &Envelope) -> Result<SmtpEnvelope> {
    let from = envelope
        .from
        .parse::<Address>()
        .map_err(|e| anyhow!("invalid sender address {}: {}", envelope.from, e))?;

    let to = envelope
        .recipients
        .iter()
        .map(|r| {
            r.parse::<Address>()
                .map_err(|e| anyhow!("invalid recipient address {}: {}", r, e))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(SmtpEnvelope::new(Some(from), to)?)
}
