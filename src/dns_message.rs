use bytes::BytesMut;

use crate::answer::AnswerSet;
use crate::dns_header::{DnsFlags, DnsHeader, ResponseCode, HEADER_LEN};
use crate::dns_record::DnsQuestion;
use crate::error::WireError;

/// Parse the DNS request from the buffer
/// Takes an immutable borrow of the buffer, returns owned structures
pub fn parse_request(buf: &[u8]) -> Result<(DnsHeader, Vec<DnsQuestion>), WireError> {
    let header = DnsHeader::from_bytes(buf)?;

    let mut questions = Vec::new();
    let mut offset = HEADER_LEN;

    for _ in 0..header.question_count {
        let (question, new_offset) = DnsQuestion::from_bytes(buf, offset)?;
        questions.push(question);
        offset = new_offset;
    }

    Ok((header, questions))
}

/// Create response header based on request header
pub fn create_response_header(
    request_header: &DnsHeader,
    rcode: ResponseCode,
    question_count: u16,
    answers: &AnswerSet,
) -> DnsHeader {
    let request_flags = request_header.flags();

    let response_flags = DnsFlags {
        qr: true,                     // This is a response
        opcode: request_flags.opcode, // Echo opcode
        aa: false,                    // Not authoritative
        tc: false,
        rd: request_flags.rd,         // Echo recursion desired
        ra: false,                    // Recursion not available
        z: 0,
        rcode,
    };

    DnsHeader {
        id: request_header.id,
        flags: response_flags.to_u16(),
        question_count,
        answer_count: answers.answers.len() as u16,
        authority_count: answers.authority.len() as u16,
        additional_count: answers.additional.len() as u16,
    }
}

/// Build the complete DNS response message
pub fn build_response(
    header: &DnsHeader,
    questions: &[DnsQuestion],
    answers: &AnswerSet,
) -> Result<Vec<u8>, WireError> {
    let mut response = BytesMut::with_capacity(512);

    header.write_to(&mut response);

    for question in questions {
        question.write_to(&mut response)?;
    }

    for record in answers
        .answers
        .iter()
        .chain(&answers.authority)
        .chain(&answers.additional)
    {
        record.write_to(&mut response)?;
    }

    Ok(response.to_vec())
}

/// Header and questions only, with the TC bit set so the client retries
/// over TCP
pub fn build_truncated(
    header: &DnsHeader,
    questions: &[DnsQuestion],
) -> Result<Vec<u8>, WireError> {
    let mut flags = header.flags();
    flags.tc = true;

    let truncated = DnsHeader {
        flags: flags.to_u16(),
        answer_count: 0,
        authority_count: 0,
        additional_count: 0,
        ..*header
    };

    build_response(&truncated, questions, &AnswerSet::default())
}

/// Header-only reply for requests we could not (or would not) process
pub fn build_error_response(request_header: &DnsHeader, rcode: ResponseCode) -> Vec<u8> {
    let header = create_response_header(request_header, rcode, 0, &AnswerSet::default());
    let mut response = BytesMut::with_capacity(HEADER_LEN);
    header.write_to(&mut response);
    response.to_vec()
}

/// Build a standard query with a single question
pub fn build_query(id: u16, question: &DnsQuestion) -> Result<Vec<u8>, WireError> {
    let header = DnsHeader {
        id,
        flags: 0x0100, // RD=1; public resolvers expect recursion desired
        question_count: 1,
        answer_count: 0,
        authority_count: 0,
        additional_count: 0,
    };

    let mut query = BytesMut::with_capacity(512);
    header.write_to(&mut query);
    question.write_to(&mut query)?;

    Ok(query.to_vec())
}
