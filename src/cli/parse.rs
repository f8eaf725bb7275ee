use crate::aggregate::Aggregator;
use crate::parser::{AccessLogParser, ParserError};
use crate::security::{SecurityDetector, SecurityError};
use crate::storage::model::LogFormat;
use serde_json::json;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseCmdError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parser error: {0}")]
    Parser(#[from] ParserError),

    #[error("security rules error: {0}")]
    Security(#[from] SecurityError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One-shot pipeline over a local file: parse, aggregate, detect, print the
/// summary JSON to stdout.
pub fn parse_file(path: &Path, format: LogFormat, top_n: usize) -> Result<(), ParseCmdError> {
    let bytes = std::fs::read(path)?;

    let parser = AccessLogParser::new(format)?;
    let result = parser.parse_bytes(&bytes);

    let aggregation = Aggregator::new().aggregate(result.events.iter());

    let detector = SecurityDetector::new()?;
    let findings = detector.detect(&result.events);

    let summary = json!({
        "parse_stats": result.to_json(),
        "aggregation": aggregation.to_json(top_n),
        "findings": findings.iter().map(|f| f.to_json()).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
