//! Path-prefix routing table for the proxy.
//!
//! Rules are validated once at startup and evaluated in order; the first
//! prefix that matches the request path wins. The table is immutable after
//! construction and is shared without locking.

use reqwest::Url;

use crate::trace::TraceSpan;

/// A backend the proxy can forward to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub name: String,
    pub base_url: Url,
}

impl ProxyTarget {
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidUrl`] when `base_url` does not parse or
    /// cannot carry a path.
    pub fn new(name: impl Into<String>, base_url: &str) -> Result<Self, RuleError> {
        let name = name.into();
        let invalid = |reason: String| RuleError::InvalidUrl {
            target: name.clone(),
            reason,
        };
        let url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if url.cannot_be_a_base() {
            return Err(invalid(format!("`{base_url}` is not a base url")));
        }
        Ok(Self {
            name,
            base_url: url,
        })
    }

    /// The backend url for an inbound path and optional query string. The
    /// base url's own path is kept as a prefix.
    #[must_use]
    pub fn url_for(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        let joined = format!("{}{}", self.base_url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url.set_query(query);
        url
    }
}

/// One routing rule: paths starting with `prefix` go to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub target: ProxyTarget,
}

/// Startup errors in the routing table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("routing table has no rules")]
    NoRules,
    #[error("rule {index} has an empty prefix")]
    EmptyPrefix { index: usize },
    #[error("rule prefix `{prefix}` must start with `/`")]
    RelativePrefix { prefix: String },
    #[error("invalid url for target `{target}`: {reason}")]
    InvalidUrl { target: String, reason: String },
}

/// Request-time routing failure. Terminal: never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no target found for path {path}")]
    NoTarget { path: String },
}

/// Ordered, immutable prefix table.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    rules: Box<[RouteRule]>,
}

impl Dispatcher {
    /// # Errors
    ///
    /// Returns [`RuleError`] for an empty table or a prefix that is empty or
    /// does not start with `/`.
    pub fn new(rules: Vec<RouteRule>) -> Result<Self, RuleError> {
        if rules.is_empty() {
            return Err(RuleError::NoRules);
        }
        for (index, rule) in rules.iter().enumerate() {
            if rule.prefix.is_empty() {
                return Err(RuleError::EmptyPrefix { index });
            }
            if !rule.prefix.starts_with('/') {
                return Err(RuleError::RelativePrefix {
                    prefix: rule.prefix.clone(),
                });
            }
        }
        Ok(Self {
            rules: rules.into_boxed_slice(),
        })
    }

    /// The two-rule deployment table: `/account/` and `/booking/`.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidUrl`] if either url is unusable.
    pub fn reference(account_url: &str, booking_url: &str) -> Result<Self, RuleError> {
        Self::new(vec![
            RouteRule {
                prefix: "/account/".to_string(),
                target: ProxyTarget::new("account", account_url)?,
            },
            RouteRule {
                prefix: "/booking/".to_string(),
                target: ProxyTarget::new("booking", booking_url)?,
            },
        ])
    }

    #[must_use]
    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// First rule whose prefix starts `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoTarget`] when no rule matches.
    pub fn select_target(&self, path: &str) -> Result<&ProxyTarget, DispatchError> {
        self.rules
            .iter()
            .find(|rule| path.starts_with(rule.prefix.as_str()))
            .map(|rule| &rule.target)
            .ok_or_else(|| DispatchError::NoTarget {
                path: path.to_string(),
            })
    }

    /// [`Self::select_target`], recording the decision on `span` and in the
    /// log.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoTarget`] when no rule matches.
    pub fn dispatch(
        &self,
        path: &str,
        span: &mut TraceSpan,
    ) -> Result<&ProxyTarget, DispatchError> {
        let selected = self.select_target(path);
        match &selected {
            Ok(target) => {
                span.set_tag("proxy_target", &target.base_url);
                tracing::debug!(path, target = %target.name, "dispatching");
            }
            Err(err) => {
                span.set_tag("proxy_error", err);
                span.set_error(err.to_string());
                tracing::warn!(path, "no proxy target");
            }
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::trace::{InMemoryExporter, Tracer, TracingConfig};

    fn reference() -> Dispatcher {
        Dispatcher::reference("http://account:8080", "http://booking:8080").unwrap()
    }

    #[test]
    fn reference_routes() {
        let dispatcher = reference();
        assert_eq!(dispatcher.select_target("/account/42").unwrap().name, "account");
        assert_eq!(dispatcher.select_target("/booking/7").unwrap().name, "booking");
        assert_eq!(
            dispatcher.select_target("/unknown"),
            Err(DispatchError::NoTarget {
                path: "/unknown".to_string()
            })
        );
        assert!(dispatcher.select_target("/account").is_err());
    }

    #[test]
    fn first_matching_rule_wins() {
        let wide = ProxyTarget::new("wide", "http://wide").unwrap();
        let narrow = ProxyTarget::new("narrow", "http://narrow").unwrap();
        let dispatcher = Dispatcher::new(vec![
            RouteRule {
                prefix: "/a/".to_string(),
                target: wide,
            },
            RouteRule {
                prefix: "/a/b/".to_string(),
                target: narrow,
            },
        ])
        .unwrap();
        assert_eq!(dispatcher.select_target("/a/b/c").unwrap().name, "wide");
    }

    #[test]
    fn rejects_bad_tables() {
        let target = ProxyTarget::new("t", "http://t").unwrap();
        assert_eq!(Dispatcher::new(vec![]).unwrap_err(), RuleError::NoRules);
        assert_eq!(
            Dispatcher::new(vec![RouteRule {
                prefix: String::new(),
                target: target.clone(),
            }])
            .unwrap_err(),
            RuleError::EmptyPrefix { index: 0 }
        );
        assert!(matches!(
            Dispatcher::new(vec![RouteRule {
                prefix: "account/".to_string(),
                target,
            }]),
            Err(RuleError::RelativePrefix { .. })
        ));
        assert!(matches!(
            Dispatcher::reference("nope", "http://booking"),
            Err(RuleError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn url_for_keeps_base_path_and_query() {
        let target = ProxyTarget::new("t", "http://backend:8080/edge/").unwrap();
        assert_eq!(
            target.url_for("/booking/7", Some("x=1")).as_str(),
            "http://backend:8080/edge/booking/7?x=1"
        );
        let bare = ProxyTarget::new("t", "http://backend:8080").unwrap();
        assert_eq!(
            bare.url_for("/account/login", None).as_str(),
            "http://backend:8080/account/login"
        );
    }

    #[test]
    fn dispatch_annotates_span() {
        let exporter = InMemoryExporter::new();
        let tracer = Tracer::new("proxy", TracingConfig::default(), exporter.clone());
        let dispatcher = reference();

        {
            let mut span = tracer.start_span("proxy_forward", None);
            assert!(dispatcher.dispatch("/account/1", &mut span).is_ok());
        }
        {
            let mut span = tracer.start_span("proxy_forward", None);
            assert!(dispatcher.dispatch("/nowhere", &mut span).is_err());
        }

        let spans = exporter.spans();
        assert_eq!(spans[0].tag("proxy_target"), Some("http://account:8080/"));
        assert!(spans[0].error.is_none());
        assert_eq!(
            spans[1].tag("proxy_error"),
            Some("no target found for path /nowhere")
        );
        assert!(spans[1].error.is_some());
    }

    proptest! {
        #[test]
        fn routing_is_deterministic(suffix in "[a-z0-9/]{0,16}") {
            let dispatcher = reference();
            let account = format!("/account/{suffix}");
            let booking = format!("/booking/{suffix}");
            let other = format!("/other/{suffix}");
            prop_assert_eq!(&dispatcher.select_target(&account).unwrap().name, "account");
            prop_assert_eq!(&dispatcher.select_target(&booking).unwrap().name, "booking");
            prop_assert!(dispatcher.select_target(&other).is_err());
        }
    }
}
