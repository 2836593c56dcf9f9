//! Query name classification.
//!
//! A name is owned by this responder when the configured pattern matches
//! at the *start* of the name, ignoring case. The match is not required to
//! cover the whole name: `^abcd.+?\.com` owns `abcd-example.com.evil.org`.
//! Patterns that want the whole name must end with `$`.

use regex::{Regex, RegexBuilder};
use tracing::{debug, info};

use crate::dns_record::validate_domain_name;
use crate::error::{ConfigError, NameDecodeError};

/// Process-wide filter settings, built once at startup and shared read-only
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub pattern: Option<Regex>,
    pub redirect_target: String,
    pub nameserver1: String,
    pub nameserver2: String,
    pub verbose: bool,
}

impl FilterConfig {
    /// Compile the pattern and check that the target names can be encoded.
    /// An empty target is allowed and is sent as the root name.
    pub fn new(
        pattern: Option<&str>,
        redirect_target: impl Into<String>,
        nameserver1: impl Into<String>,
        nameserver2: impl Into<String>,
        verbose: bool,
    ) -> Result<Self, ConfigError> {
        let pattern = pattern.map(compile_pattern).transpose()?;

        let config = FilterConfig {
            pattern,
            redirect_target: redirect_target.into(),
            nameserver1: nameserver1.into(),
            nameserver2: nameserver2.into(),
            verbose,
        };

        for (field, name) in [
            ("cname", &config.redirect_target),
            ("ns1", &config.nameserver1),
            ("ns2", &config.nameserver2),
        ] {
            validate_domain_name(name).map_err(|source| ConfigError::TargetName {
                field,
                name: name.clone(),
                source,
            })?;
        }

        Ok(config)
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    // Anchor at the start only; a trailing match is not required
    RegexBuilder::new(&format!("^(?:{})", pattern))
        .case_insensitive(true)
        .build()
        .map_err(|source| ConfigError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Turn a query name, given either as wire bytes or as text, into text.
pub fn normalize_name<N: AsRef<[u8]> + ?Sized>(name: &N) -> Result<&str, NameDecodeError> {
    std::str::from_utf8(name.as_ref()).map_err(|e| NameDecodeError {
        valid_up_to: e.valid_up_to(),
    })
}

/// Decides whether a query name belongs to this responder
#[derive(Debug, Clone)]
pub struct Matcher {
    pattern: Option<Regex>,
    verbose: bool,
}

impl Matcher {
    pub fn new(config: &FilterConfig) -> Self {
        Matcher {
            pattern: config.pattern.clone(),
            verbose: config.verbose,
        }
    }

    /// Names that are not valid UTF-8 never match.
    pub fn classify<N: AsRef<[u8]> + ?Sized>(&self, name: &N) -> bool {
        self.owned_name(name).is_some()
    }

    /// Decode and classify in one step, handing back the decoded name when
    /// it is owned here. Logs one line per call when verbose.
    pub fn owned_name<'a, N: AsRef<[u8]> + ?Sized>(&self, name: &'a N) -> Option<&'a str> {
        let text = match normalize_name(name) {
            Ok(text) => text,
            Err(e) => {
                let lossy = String::from_utf8_lossy(name.as_ref());
                debug!(name = %lossy, error = %e, "Undecodable query name");
                if self.verbose {
                    info!("{:?} is not matching", lossy);
                }
                return None;
            }
        };

        let matched = self
            .pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(text));

        if self.verbose {
            if matched {
                info!("{:?} will be redirected", text);
            } else {
                info!("{:?} is not matching", text);
            }
        }

        matched.then_some(text)
    }
}
