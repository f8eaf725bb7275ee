use crate::errorlog::{ErrorLogError, ErrorRecord};
use regex::Regex;
use sha2::{Digest, Sha256};

/// Produces a stable digest for a class of errors by stripping the variable
/// payload out of messages before hashing.
pub struct Fingerprinter {
    integers: Regex,
    hex_values: Regex,
    double_quoted: Regex,
    single_quoted: Regex,
    abs_paths: Regex,
    urls: Regex,
    python_frame: Regex,
    jvm_frame: Regex,
}

impl Fingerprinter {
    pub fn new() -> Result<Self, ErrorLogError> {
        Ok(Self {
            integers: Regex::new(r"\b\d+\b")?,
            hex_values: Regex::new(r"0x[0-9a-fA-F]+")?,
            double_quoted: Regex::new(r#""[^"]*""#)?,
            single_quoted: Regex::new(r"'[^']*'")?,
            abs_paths: Regex::new(r"/[\w/.-]+")?,
            urls: Regex::new(r"https?://\S+")?,
            python_frame: Regex::new(r#"File "([^"]+)", line (\d+), in (\w+)"#)?,
            jvm_frame: Regex::new(r"at ([\w.]+)\(([\w.]+):(\d+)")?,
        })
    }

    /// Replace variable substrings with fixed placeholders. Replacement
    /// order matters: paths run before URLs, so URL bodies collapse through
    /// the path rule.
    pub fn normalize_message(&self, message: &str) -> String {
        let message = self.integers.replace_all(message, "N");
        let message = self.hex_values.replace_all(&message, "0xHEX");
        let message = self.double_quoted.replace_all(&message, "\"STR\"");
        let message = self.single_quoted.replace_all(&message, "'STR'");
        let message = self.abs_paths.replace_all(&message, "/PATH");
        let message = self.urls.replace_all(&message, "URL");
        message.into_owned()
    }

    /// First parseable frame of a stack trace as `file:line:function`.
    fn extract_first_frame(&self, stack_trace: &str) -> Option<String> {
        if let Some(caps) = self.python_frame.captures(stack_trace) {
            return Some(format!("{}:{}:{}", &caps[1], &caps[2], &caps[3]));
        }
        if let Some(caps) = self.jvm_frame.captures(stack_trace) {
            return Some(format!("{}:{}:{}", &caps[2], &caps[3], &caps[1]));
        }
        None
    }

    /// Lowercase SHA-256 hex over `error_type | normalized_message` plus the
    /// most specific location available.
    pub fn fingerprint(&self, record: &ErrorRecord) -> String {
        let mut parts = vec![
            record.error_type.clone(),
            self.normalize_message(&record.error_message),
        ];

        if let (Some(file), Some(line)) = (&record.file_path, record.line_number) {
            parts.push(format!("{file}:{line}"));
        } else if let Some(stack) = &record.stack_trace {
            if let Some(frame) = self.extract_first_frame(stack) {
                parts.push(frame);
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(parts.join("|").as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
