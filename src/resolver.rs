use bytes::Bytes;

use crate::answer::{AnswerBuilder, AnswerSet};
use crate::dns_record::{DnsQuestion, RecordType, CLASS_IN};
use crate::error::ResolveError;
use crate::filter::{FilterConfig, Matcher};

/// A single question handed to a resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub name: Bytes,
    pub qtype: u16,
    pub qclass: u16,
}

impl Query {
    pub fn new(name: impl Into<Bytes>, qtype: u16, qclass: u16) -> Self {
        Query {
            name: name.into(),
            qtype,
            qclass,
        }
    }

    /// The query used for an "all records for this name" lookup
    pub fn all_records(name: impl Into<Bytes>) -> Self {
        Query::new(name, RecordType::ANY.to_u16(), CLASS_IN)
    }
}

impl From<&DnsQuestion> for Query {
    fn from(question: &DnsQuestion) -> Self {
        Query::new(question.name.clone(), question.qtype, question.qclass)
    }
}

/// Outcome of a resolver that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Answered(AnswerSet),
    /// The name is not handled here; the next resolver may try
    NotOwned,
}

/// Anything that can take part in a resolver chain.
///
/// `Ok(Resolution::NotOwned)` means "ask someone else"; `Err` means the
/// resolver itself broke (upstream unreachable, garbage response, ...).
pub trait Resolver: Send + Sync {
    fn query(&self, query: &Query) -> Result<Resolution, ResolveError>;

    fn lookup_all_records(&self, name: &[u8]) -> Result<Resolution, ResolveError> {
        self.query(&Query::all_records(Bytes::copy_from_slice(name)))
    }
}

/// Answers owned names with a fixed redirection, declines everything else
#[derive(Debug, Clone)]
pub struct DynamicResolver {
    matcher: Matcher,
    builder: AnswerBuilder,
}

impl DynamicResolver {
    pub fn new(config: &FilterConfig) -> Self {
        DynamicResolver {
            matcher: Matcher::new(config),
            builder: AnswerBuilder::new(config),
        }
    }

    /// Query type and class do not influence the outcome.
    pub fn resolve(&self, query: &Query) -> Resolution {
        match self.matcher.owned_name(&query.name[..]) {
            Some(name) => Resolution::Answered(self.builder.build_answer(name)),
            None => Resolution::NotOwned,
        }
    }
}

impl Resolver for DynamicResolver {
    fn query(&self, query: &Query) -> Result<Resolution, ResolveError> {
        Ok(self.resolve(query))
    }
}

/// Tries resolvers in order until one answers
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn Resolver>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl Resolver for ResolverChain {
    fn query(&self, query: &Query) -> Result<Resolution, ResolveError> {
        for resolver in &self.resolvers {
            if let Resolution::Answered(set) = resolver.query(query)? {
                return Ok(Resolution::Answered(set));
            }
        }
        Ok(Resolution::NotOwned)
    }
}
