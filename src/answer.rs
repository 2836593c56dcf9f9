use crate::dns_record::{RData, ResourceRecord, Soa};
use crate::filter::FilterConfig;

pub const SOA_SERIAL: u32 = 2018101700;
pub const SOA_REFRESH: u32 = 10800;
pub const SOA_RETRY: u32 = 2000;
pub const SOA_EXPIRE: u32 = 604800;
pub const SOA_MINIMUM: u32 = 86400;

/// TTL put on every synthesized record
pub const ANSWER_TTL: u32 = 0;

/// The three record sections of a successful resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerSet {
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

/// Builds the redirection answer for owned names
#[derive(Debug, Clone)]
pub struct AnswerBuilder {
    redirect_target: String,
    nameserver1: String,
    nameserver2: String,
}

impl AnswerBuilder {
    pub fn new(config: &FilterConfig) -> Self {
        AnswerBuilder {
            redirect_target: config.redirect_target.clone(),
            nameserver1: config.nameserver1.clone(),
            nameserver2: config.nameserver2.clone(),
        }
    }

    /// CNAME, SOA, NS, NS, all owned by `name` as queried.
    /// Authority and additional sections are always empty.
    pub fn build_answer(&self, name: &str) -> AnswerSet {
        let answers = vec![
            ResourceRecord::new(name, ANSWER_TTL, RData::Cname(self.redirect_target.clone())),
            ResourceRecord::new(name, ANSWER_TTL, RData::Soa(zone_soa())),
            ResourceRecord::new(name, ANSWER_TTL, RData::Ns(self.nameserver1.clone())),
            ResourceRecord::new(name, ANSWER_TTL, RData::Ns(self.nameserver2.clone())),
        ];

        AnswerSet {
            answers,
            ..AnswerSet::default()
        }
    }
}

// Primary and admin names are left empty, which goes out as the root name
fn zone_soa() -> Soa {
    Soa {
        mname: String::new(),
        rname: String::new(),
        serial: SOA_SERIAL,
        refresh: SOA_REFRESH,
        retry: SOA_RETRY,
        expire: SOA_EXPIRE,
        minimum: SOA_MINIMUM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_record::{RecordType, CLASS_IN};

    fn builder() -> AnswerBuilder {
        let config = FilterConfig::new(
            Some(r"^abcd.+?\.com$"),
            "xyz.net",
            "ns1.example.com.",
            "ns2.example.com.",
            false,
        )
        .unwrap();
        AnswerBuilder::new(&config)
    }

    #[test]
    fn test_answer_structure() {
        let name = "abcd-example.com";
        let set = builder().build_answer(name);

        assert_eq!(set.answers.len(), 4);
        assert!(set.authority.is_empty());
        assert!(set.additional.is_empty());

        for record in &set.answers {
            assert_eq!(record.name, name);
            assert_eq!(record.rclass, CLASS_IN);
        }

        assert_eq!(set.answers[0].rdata, RData::Cname("xyz.net".to_string()));
        assert_eq!(
            set.answers[1].rdata,
            RData::Soa(Soa {
                mname: String::new(),
                rname: String::new(),
                serial: 2018101700,
                refresh: 10800,
                retry: 2000,
                expire: 604800,
                minimum: 86400,
            })
        );
        assert_eq!(set.answers[2].rdata, RData::Ns("ns1.example.com.".to_string()));
        assert_eq!(set.answers[3].rdata, RData::Ns("ns2.example.com.".to_string()));
    }

    #[test]
    fn test_record_types_in_order() {
        let types: Vec<u16> = builder()
            .build_answer("abcd-x.com")
            .answers
            .iter()
            .map(|r| r.rtype())
            .collect();

        assert_eq!(
            types,
            vec![
                RecordType::CNAME.to_u16(),
                RecordType::SOA.to_u16(),
                RecordType::NS.to_u16(),
                RecordType::NS.to_u16(),
            ]
        );
    }

    #[test]
    fn test_name_is_echoed_unchanged() {
        let set = builder().build_answer("ABCD-Mixed.Case.COM");
        assert!(set.answers.iter().all(|r| r.name == "ABCD-Mixed.Case.COM"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = builder();
        assert_eq!(
            builder.build_answer("abcd-1.com"),
            builder.build_answer("abcd-1.com")
        );
    }

    #[test]
    fn test_unset_targets_build_placeholders() {
        let config = FilterConfig::new(None, "", "", "", false).unwrap();
        let set = AnswerBuilder::new(&config).build_answer("a.com");

        assert_eq!(set.answers.len(), 4);
        assert_eq!(set.answers[0].rdata, RData::Cname(String::new()));
    }
}
