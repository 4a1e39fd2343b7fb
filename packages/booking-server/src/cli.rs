//! Command line and environment configuration for `booking-stack`.

use std::time::Duration;

use booking_core::PropagationFormat;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::account::UpstreamConfig;
use crate::app::BookingConfig;
use crate::consumer::{AckPolicy, ConsumerConfig};
use crate::network::NetworkConfig;
use crate::observability::LogFormat;
use crate::proxy::{ProxyConfig, RetryPolicy};
use crate::trace::TracingConfig;

#[derive(Debug, Parser)]
#[command(name = "booking-stack", version, about = "Booking relay services")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log output format: json or pretty.
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "METRICS_PORT", global = true)]
    pub metrics_port: Option<u16>,

    #[command(flatten)]
    pub tracing: TracingArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Edge proxy routing `/account/` and `/booking/`.
    Proxy(ProxyArgs),
    /// Account service owning the booking store.
    Account(ListenArgs),
    /// Booking front door with its queue consumer.
    Booking(BookingArgs),
    /// Every service in one process behind the proxy.
    All(AllArgs),
}

#[derive(Debug, Clone, Args)]
pub struct TracingArgs {
    /// Trace header format: jaeger or w3c.
    #[arg(long, env = "TRACE_FORMAT", default_value = "jaeger", global = true)]
    pub trace_format: PropagationFormat,

    /// Sampling flag for traces started here.
    #[arg(long, env = "TRACE_SAMPLED", default_value_t = true, action = ArgAction::Set, global = true)]
    pub trace_sampled: bool,

    /// Jaeger agent (`host:port`, UDP) to export spans to. Unset keeps spans
    /// in the process logs only.
    #[arg(long, env = "JAEGER_AGENT_ENDPOINT", global = true)]
    pub jaeger_agent: Option<String>,
}

impl TracingArgs {
    #[must_use]
    pub fn config(&self) -> TracingConfig {
        TracingConfig {
            format: self.trace_format,
            sampled: self.trace_sampled,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ListenArgs {
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "LISTEN_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Per-request timeout in milliseconds.
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,
}

impl ListenArgs {
    #[must_use]
    pub fn network(&self, service: &str) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..NetworkConfig::for_service(service)
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ProxyArgs {
    #[command(flatten)]
    pub listen: ListenArgs,

    #[arg(long, env = "ACCOUNT_URL", default_value = "http://account:8080")]
    pub account_url: String,

    #[arg(long, env = "BOOKING_URL", default_value = "http://booking:8080")]
    pub booking_url: String,

    #[command(flatten)]
    pub forward: ForwardArgs,
}

impl ProxyArgs {
    #[must_use]
    pub fn config(&self) -> ProxyConfig {
        self.forward
            .config(self.account_url.clone(), self.booking_url.clone())
    }
}

/// Per-forward bounds for the proxy.
#[derive(Debug, Clone, Args)]
pub struct ForwardArgs {
    /// Timeout for one forwarded call, in milliseconds.
    #[arg(long, env = "UPSTREAM_TIMEOUT_MS", default_value_t = 10_000)]
    pub upstream_timeout_ms: u64,

    /// Total tries per forwarded request, including the first.
    #[arg(long, env = "PROXY_MAX_ATTEMPTS", default_value_t = 3)]
    pub proxy_max_attempts: u32,

    /// Backoff before the first retry, in milliseconds; doubles per retry.
    #[arg(long, env = "PROXY_BACKOFF_MS", default_value_t = 50)]
    pub proxy_backoff_ms: u64,
}

impl ForwardArgs {
    fn config(&self, account_url: String, booking_url: String) -> ProxyConfig {
        ProxyConfig {
            account_url,
            booking_url,
            retry: RetryPolicy {
                max_attempts: self.proxy_max_attempts,
                initial_backoff: Duration::from_millis(self.proxy_backoff_ms),
                ..RetryPolicy::default()
            },
            upstream_timeout: Duration::from_millis(self.upstream_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AckPolicyArg {
    OnReceipt,
    OnSuccess,
}

#[derive(Debug, Clone, Args)]
pub struct QueueArgs {
    #[arg(long, env = "QUEUE_NAME", default_value = "hello")]
    pub queue_name: String,

    /// Publish timeout in milliseconds.
    #[arg(long, env = "PUBLISH_TIMEOUT_MS", default_value_t = 2_000)]
    pub publish_timeout_ms: u64,

    #[arg(long, env = "ACK_POLICY", value_enum, default_value_t = AckPolicyArg::OnSuccess)]
    pub ack_policy: AckPolicyArg,

    /// Requeues allowed per message under `on-success`.
    #[arg(long, env = "MAX_REDELIVERIES", default_value_t = 3)]
    pub max_redeliveries: u32,
}

impl QueueArgs {
    #[must_use]
    pub fn ack_policy(&self) -> AckPolicy {
        match self.ack_policy {
            AckPolicyArg::OnReceipt => AckPolicy::OnReceipt,
            AckPolicyArg::OnSuccess => AckPolicy::OnSuccess {
                max_redeliveries: self.max_redeliveries,
            },
        }
    }

    fn booking_config(&self, upstream: UpstreamConfig) -> BookingConfig {
        BookingConfig {
            upstream,
            queue_name: self.queue_name.clone(),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            consumer: ConsumerConfig {
                ack_policy: self.ack_policy(),
            },
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct BookingArgs {
    #[command(flatten)]
    pub listen: ListenArgs,

    #[arg(long, env = "ACCOUNT_URL", default_value = "http://account:8080")]
    pub account_url: String,

    /// Timeout for calls to the account service, in milliseconds.
    #[arg(long, env = "UPSTREAM_TIMEOUT_MS", default_value_t = 5_000)]
    pub upstream_timeout_ms: u64,

    #[command(flatten)]
    pub queue: QueueArgs,
}

impl BookingArgs {
    #[must_use]
    pub fn config(&self) -> BookingConfig {
        self.queue.booking_config(UpstreamConfig {
            account_url: self.account_url.clone(),
            timeout: Duration::from_millis(self.upstream_timeout_ms),
        })
    }
}

/// `all`: account and booking bind OS-assigned loopback ports and the proxy
/// listens on `LISTEN_HOST:LISTEN_PORT`.
#[derive(Debug, Clone, Args)]
pub struct AllArgs {
    #[command(flatten)]
    pub listen: ListenArgs,

    #[command(flatten)]
    pub forward: ForwardArgs,

    #[command(flatten)]
    pub queue: QueueArgs,
}

impl AllArgs {
    /// Booking settings once the account service's address is known.
    #[must_use]
    pub fn booking_config(&self, account_url: String) -> BookingConfig {
        self.queue.booking_config(UpstreamConfig {
            account_url,
            timeout: Duration::from_millis(self.forward.upstream_timeout_ms),
        })
    }

    /// Proxy settings once both backend addresses are known.
    #[must_use]
    pub fn proxy_config(&self, account_url: String, booking_url: String) -> ProxyConfig {
        self.forward.config(account_url, booking_url)
    }

    /// Loopback listener for an internal service.
    #[must_use]
    pub fn internal_network(&self, service: &str) -> NetworkConfig {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..self.listen.network(service)
        }
    }
}
