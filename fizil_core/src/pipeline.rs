//! Orders the mutation strategies and flat-maps them across the example
//! corpus into one lazy stream of test cases.

use crate::strategy::{self, Strategy};
use crate::test_case::TestCase;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A seed input loaded before the run begins.
#[derive(Debug, Clone)]
pub struct Example {
    pub data: Vec<u8>,
    pub source_file: PathBuf,
    pub file_extension: String,
}

impl Example {
    /// Reads one seed file; the extension (with its dot) is kept so that
    /// findings derived from this example carry the same suffix.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let mut data = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut data)?;
        let file_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        Ok(Self {
            data,
            source_file: path.to_path_buf(),
            file_extension,
        })
    }
}

/// Parses a dictionary file: one token per line, `#` comments, optional
/// surrounding double quotes with `\\`, `\"` and `\xNN` escapes.
pub fn load_dictionary(path: &Path) -> io::Result<Vec<Vec<u8>>> {
    let text = std::fs::read_to_string(path)?;
    let mut tokens = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let token = match line.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) {
            Some(quoted) => unescape(quoted),
            None => line.as_bytes().to_vec(),
        };
        if !token.is_empty() {
            tokens.push(token);
        }
    }
    Ok(tokens)
}

fn unescape(quoted: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(quoted.len());
    let mut bytes = quoted.bytes();
    while let Some(byte) = bytes.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'"') => out.push(b'"'),
            Some(b'x') => {
                let hi = bytes.next();
                let lo = bytes.next();
                let parsed = hi
                    .zip(lo)
                    .map(|(h, l)| [h, l])
                    .and_then(|pair| std::str::from_utf8(&pair).ok().map(str::to_string))
                    .and_then(|hex| u8::from_str_radix(&hex, 16).ok());
                match parsed {
                    Some(value) => out.push(value),
                    // Malformed escape: keep it literally rather than drop data.
                    None => out.extend_from_slice(b"\\x"),
                }
            }
            Some(other) => {
                out.push(b'\\');
                out.push(other);
            }
            None => out.push(b'\\'),
        }
    }
    out
}

/// The global test-case stream: every strategy in fixed order, applied to
/// every example in load order. Nothing beyond the current stage position
/// is ever materialized.
pub struct TestCasePipeline {
    examples: Vec<Example>,
    strategies: Vec<Strategy>,
}

impl TestCasePipeline {
    pub fn new(examples: Vec<Example>, dictionary: Vec<Vec<u8>>) -> Self {
        Self {
            examples,
            strategies: strategy::strategy_order(&dictionary),
        }
    }

    pub fn example_count(&self) -> usize {
        self.examples.len()
    }

    pub fn example_bytes(&self) -> u64 {
        self.examples.iter().map(|e| e.data.len() as u64).sum()
    }

    /// Estimated size of the stream, from stage metadata. Display only.
    pub fn expected_case_count(&self) -> u64 {
        self.strategies
            .iter()
            .flat_map(|strategy| {
                self.examples.iter().map(move |example| {
                    strategy(&example.data)
                        .info
                        .cases_per_example
                        .expected_cases(example.data.len())
                })
            })
            .sum()
    }

    /// Consumes the pipeline into the lazy test-case stream. Single-pass.
    pub fn test_cases(self) -> impl Iterator<Item = TestCase> + Send {
        let examples = Arc::new(self.examples);
        self.strategies.into_iter().flat_map(move |strategy| {
            let examples = Arc::clone(&examples);
            (0..examples.len()).flat_map(move |index| {
                let example = examples[index].clone();
                let stage = strategy(&example.data);
                let info = stage.info;
                let source_file = stage.verbatim.then(|| example.source_file.clone());
                stage.cases.map(move |data| TestCase {
                    data,
                    file_extension: example.file_extension.clone(),
                    source_file: source_file.clone(),
                    stage: Arc::clone(&info),
                })
            })
        })
    }
}
