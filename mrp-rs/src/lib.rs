//! Run environment for models that follow the Model Run Protocol.
//!
//! A run is described by a JSON document on stdin with three sections:
//! `input` (model parameters, plus the reserved `seed` and `replicate`),
//! `model.files` (named input files) and `output` (where results go).
//! TOML is accepted as an alternate encoding of the same document.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Errors raised while reading the run description or writing outputs.
#[derive(Debug, thiserror::Error)]
pub enum MrpError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to deserialize model input: {source}")]
    Input { source: serde_json::Error },

    #[error("no input on stdin")]
    EmptyInput,
}

/// Whether a manifest entry was read or produced by the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Input,
    Output,
}

impl ManifestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestKind::Input => "input",
            ManifestKind::Output => "output",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub kind: ManifestKind,
    pub name: String,
    pub sha256: String,
}

pub const MANIFEST_FILE: &str = "manifest.csv";

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub struct Environment<I = ()> {
    input_json: serde_json::Map<String, Value>,
    pub input: Option<I>,
    pub seed: u64,
    pub replicate: u64,
    pub files: HashMap<String, PathBuf>,
    output: Value,
    manifest: Vec<ManifestEntry>,
}

impl Environment {
    pub fn from_json(data: Value) -> Self {
        let mut input_json = data
            .get("input")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        let seed = input_json
            .remove("seed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let replicate = input_json
            .remove("replicate")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let files = data
            .get("model")
            .and_then(|m| m.get("files"))
            .and_then(|f| f.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), PathBuf::from(s))))
                    .collect()
            })
            .unwrap_or_default();

        let output = data.get("output").cloned().unwrap_or(Value::Null);

        Self {
            input_json,
            input: None,
            seed,
            replicate,
            files,
            output,
            manifest: Vec::new(),
        }
    }

    /// Parses a run description, trying JSON first and TOML second.
    pub fn parse(raw: &str) -> Result<Self, MrpError> {
        if raw.trim().is_empty() {
            return Err(MrpError::EmptyInput);
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(data) => Ok(Self::from_json(data)),
            Err(json_err) => match toml::from_str::<toml::Value>(raw) {
                Ok(doc) => {
                    log::debug!("run description parsed as TOML");
                    Ok(Self::from_json(serde_json::to_value(doc)?))
                }
                // Report against the encoding the document appears to use
                Err(toml_err) if raw.trim_start().starts_with('{') => {
                    log::debug!("TOML fallback also failed: {toml_err}");
                    Err(MrpError::Json(json_err))
                }
                Err(toml_err) => Err(MrpError::Toml(toml_err)),
            },
        }
    }

    pub fn from_stdin() -> Result<Self, MrpError> {
        let mut raw = String::new();
        io::stdin().read_to_string(&mut raw)?;
        Self::parse(&raw)
    }

    pub fn with_input_type<I: DeserializeOwned>(self) -> Result<Environment<I>, MrpError> {
        let input_value = Value::Object(self.input_json.clone());
        let input = serde_json::from_value(input_value).map_err(|source| MrpError::Input { source })?;
        Ok(Environment {
            input_json: self.input_json,
            input: Some(input),
            seed: self.seed,
            replicate: self.replicate,
            files: self.files,
            output: self.output,
            manifest: self.manifest,
        })
    }
}

impl<I: DeserializeOwned> Environment<I> {
    pub fn load() -> Result<Self, MrpError> {
        Environment::from_stdin()?.with_input_type::<I>()
    }
}

impl<I> Environment<I> {
    pub fn input_json(&self) -> &serde_json::Map<String, Value> {
        &self.input_json
    }

    pub fn file(&self, name: &str) -> Option<&Path> {
        self.files.get(name).map(PathBuf::as_path)
    }

    pub fn manifest(&self) -> &[ManifestEntry] {
        &self.manifest
    }

    pub fn output_dir(&self) -> Option<PathBuf> {
        let output = &self.output;

        // Check flat output
        if output.get("spec").and_then(|v| v.as_str()) == Some("filesystem") {
            return output.get("dir").and_then(|v| v.as_str()).map(PathBuf::from);
        }

        // Check profiled output, resolving the default profile
        let profile = output
            .get("profile")
            .and_then(|v| v.as_object())
            .and_then(|profiles| profiles.get("default").or_else(|| profiles.values().next()))?;
        if profile.get("spec").and_then(|v| v.as_str()) == Some("filesystem") {
            return profile.get("dir").and_then(|v| v.as_str()).map(PathBuf::from);
        }

        None
    }

    /// Hashes the bytes of a named input file into the manifest.
    pub fn record_input(&mut self, name: &str, path: &Path) -> Result<(), MrpError> {
        let data = fs::read(path)?;
        self.manifest.push(ManifestEntry {
            kind: ManifestKind::Input,
            name: name.to_string(),
            sha256: sha256_hex(&data),
        });
        Ok(())
    }

    /// Writes `data` to `filename` in the output directory, replacing any
    /// previous file, or to stdout when no directory is configured.
    pub fn write(&mut self, filename: &str, data: &[u8]) -> Result<(), MrpError> {
        if let Some(dir) = self.output_dir() {
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(filename), data)?;
            log::info!("wrote {}", dir.join(filename).display());
        } else {
            io::stdout().write_all(data)?;
        }
        self.manifest.push(ManifestEntry {
            kind: ManifestKind::Output,
            name: filename.to_string(),
            sha256: sha256_hex(data),
        });
        Ok(())
    }

    pub fn write_csv(
        &mut self,
        filename: &str,
        headers: &[&str],
        rows: &[Vec<String>],
    ) -> Result<(), MrpError> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record(headers)?;
        for row in rows {
            wtr.write_record(row)?;
        }
        let data = wtr
            .into_inner()
            .map_err(|e| MrpError::Io(e.into_error()))?;
        self.write(filename, &data)
    }

    /// Writes the digests recorded so far. The manifest does not list itself.
    pub fn write_manifest(&mut self) -> Result<(), MrpError> {
        let rows: Vec<Vec<String>> = self
            .manifest
            .iter()
            .map(|entry| {
                vec![
                    entry.kind.as_str().to_string(),
                    entry.name.clone(),
                    entry.sha256.clone(),
                ]
            })
            .collect();
        let recorded = self.manifest.len();
        self.write_csv(MANIFEST_FILE, &["kind", "name", "sha256"], &rows)?;
        self.manifest.truncate(recorded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_from_json_basic() {
        let data = json!({
            "input": {
                "seed": 42,
                "replicate": 1,
                "n_draws": 100
            },
            "model": {
                "files": {
                    "survey": "/tmp/survey.csv"
                }
            },
            "output": {
                "spec": "filesystem",
                "dir": "/tmp/output"
            }
        });
        let ctx = Environment::from_json(data);
        assert_eq!(ctx.seed, 42);
        assert_eq!(ctx.replicate, 1);
        assert_eq!(ctx.input_json().get("n_draws").unwrap().as_u64().unwrap(), 100);
        assert!(!ctx.input_json().contains_key("seed"));
        assert!(!ctx.input_json().contains_key("replicate"));
        assert_eq!(ctx.file("survey"), Some(Path::new("/tmp/survey.csv")));
        assert_eq!(ctx.output_dir(), Some(PathBuf::from("/tmp/output")));
    }

    #[test]
    fn test_with_input_type() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Params {
            n_draws: usize,
        }
        let data = json!({
            "input": {
                "seed": 42,
                "n_draws": 25
            }
        });
        let ctx = Environment::from_json(data)
            .with_input_type::<Params>()
            .unwrap();
        assert_eq!(ctx.input, Some(Params { n_draws: 25 }));
        assert_eq!(ctx.seed, 42);
    }

    #[test]
    fn test_with_input_type_rejects_bad_input() {
        #[derive(Deserialize, Debug)]
        #[allow(dead_code)]
        struct Params {
            n_draws: usize,
        }
        let data = json!({ "input": { "n_draws": "many" } });
        let result = Environment::from_json(data).with_input_type::<Params>();
        assert!(matches!(result, Err(MrpError::Input { .. })));
    }

    #[test]
    fn test_parse_toml_fallback() {
        let raw = r#"
            [input]
            seed = 7
            n_draws = 10

            [model.files]
            survey = "survey.csv"
        "#;
        let ctx = Environment::parse(raw).unwrap();
        assert_eq!(ctx.seed, 7);
        assert_eq!(ctx.input_json().get("n_draws").unwrap().as_u64(), Some(10));
        assert_eq!(ctx.file("survey"), Some(Path::new("survey.csv")));
    }

    #[test]
    fn test_parse_empty() {
        assert!(matches!(Environment::parse("  \n"), Err(MrpError::EmptyInput)));
        assert!(matches!(Environment::parse("{ not json"), Err(MrpError::Json(_))));
    }

    #[test]
    fn test_parse_reports_toml_errors() {
        let raw = "[input]
seed = = 3
";
        assert!(matches!(Environment::parse(raw), Err(MrpError::Toml(_))));
    }

    #[test]
    fn test_output_dir_profiled() {
        let data = json!({
            "input": {},
            "output": {
                "profile": {
                    "default": {
                        "spec": "filesystem",
                        "dir": "/tmp/profiled"
                    }
                }
            }
        });
        let ctx = Environment::from_json(data);
        assert_eq!(ctx.output_dir(), Some(PathBuf::from("/tmp/profiled")));
    }

    #[test]
    fn test_output_dir_none() {
        let data = json!({
            "input": {},
            "output": {
                "spec": "stdout"
            }
        });
        let ctx = Environment::from_json(data);
        assert_eq!(ctx.output_dir(), None);
    }

    #[test]
    fn test_defaults() {
        let data = json!({});
        let ctx = Environment::from_json(data);
        assert_eq!(ctx.seed, 0);
        assert_eq!(ctx.replicate, 0);
        assert!(ctx.input_json().is_empty());
        assert!(ctx.files.is_empty());
        assert_eq!(ctx.output_dir(), None);
    }

    #[test]
    fn test_write_csv_overwrites_and_records_digest() {
        let dir = tempfile::tempdir().unwrap();
        let data = json!({
            "output": { "spec": "filesystem", "dir": dir.path().to_str().unwrap() }
        });
        let mut ctx = Environment::from_json(data);
        let rows = vec![vec!["1".to_string(), "0.5".to_string()]];
        ctx.write_csv("out.csv", &["areaId", "p"], &rows).unwrap();
        ctx.write_csv("out.csv", &["areaId", "p"], &rows).unwrap();

        let written = fs::read(dir.path().join("out.csv")).unwrap();
        assert_eq!(String::from_utf8(written.clone()).unwrap(), "areaId,p\n1,0.5\n");
        assert_eq!(ctx.manifest().len(), 2);
        assert_eq!(ctx.manifest()[1].sha256, sha256_hex(&written));
        assert_eq!(ctx.manifest()[1].kind, ManifestKind::Output);
    }

    #[test]
    fn test_manifest_lists_inputs_and_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("survey.csv");
        fs::write(&input_path, b"areaId\n1\n").unwrap();
        let out_dir = dir.path().join("out");
        let data = json!({
            "output": { "spec": "filesystem", "dir": out_dir.to_str().unwrap() }
        });
        let mut ctx = Environment::from_json(data);
        ctx.record_input("survey", &input_path).unwrap();
        ctx.write("notes.txt", b"hello").unwrap();
        ctx.write_manifest().unwrap();

        let manifest = fs::read_to_string(out_dir.join(MANIFEST_FILE)).unwrap();
        let lines: Vec<&str> = manifest.lines().collect();
        assert_eq!(lines[0], "kind,name,sha256");
        assert_eq!(
            lines[1],
            format!("input,survey,{}", sha256_hex(b"areaId\n1\n"))
        );
        assert_eq!(lines[2], format!("output,notes.txt,{}", sha256_hex(b"hello")));
        assert_eq!(lines.len(), 3);
        assert_eq!(ctx.manifest().len(), 2);
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
