//! Test doubles for the external dump/restore tools.
//!
//! [`ScriptedRunner`] stands in for the process layer: it records every call,
//! answers with scripted outcomes, and can emulate the filesystem effects of
//! `mongodump --out` and `mongorestore` so whole pipelines run without a server.

use crate::tools::{CommandOutput, CommandRunner};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum Outcome {
    Exit { code: i32, stderr: String },
    Missing,
}

#[derive(Debug, Clone)]
struct Rule {
    program: String,
    marker: Option<String>,
    outcome: Outcome,
}

/// Scripted [`CommandRunner`]. Unscripted calls succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
    dump_files: Mutex<Vec<(String, Vec<u8>)>>,
    restored: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files `mongodump --out DIR` writes under `DIR/<db>/`.
    pub fn with_dump_files(self, files: &[(&str, &[u8])]) -> Self {
        if let Ok(mut dump) = self.dump_files.lock() {
            dump.extend(files.iter().map(|(n, b)| (n.to_string(), b.to_vec())));
        }
        self
    }

    /// Replace the files later dumps write.
    pub fn set_dump_files(&self, files: &[(&str, &[u8])]) {
        if let Ok(mut dump) = self.dump_files.lock() {
            *dump = files.iter().map(|(n, b)| (n.to_string(), b.to_vec())).collect();
        }
    }

    /// Every call to `program` exits with `code` and `stderr`.
    pub fn fail(&self, program: &str, code: i32, stderr: &str) {
        self.push(program, None, Outcome::Exit { code, stderr: stderr.to_string() });
    }

    /// Calls to `program` whose arguments include `marker` exit with `code` and `stderr`.
    pub fn fail_when(&self, program: &str, marker: &str, code: i32, stderr: &str) {
        self.push(
            program,
            Some(marker.to_string()),
            Outcome::Exit { code, stderr: stderr.to_string() },
        );
    }

    /// `program` cannot be spawned.
    pub fn missing(&self, program: &str) {
        self.push(program, None, Outcome::Missing);
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Relative path -> bytes of everything the last `mongorestore` call saw.
    pub fn restored(&self) -> BTreeMap<String, Vec<u8>> {
        self.restored.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn push(&self, program: &str, marker: Option<String>, outcome: Outcome) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                program: program.to_string(),
                marker,
                outcome,
            });
        }
    }

    fn outcome_for(&self, program: &str, args: &[String]) -> Option<Outcome> {
        let rules = self.rules.lock().ok()?;
        rules
            .iter()
            .rev()
            .find(|r| {
                r.program == program
                    && r.marker.as_ref().map_or(true, |m| args.iter().any(|a| a == m))
            })
            .map(|r| r.outcome.clone())
    }

    fn emulate_dump(&self, args: &[String]) -> std::io::Result<()> {
        let (Some(out), Some(db)) = (arg_after(args, "--out"), arg_after(args, "--db")) else {
            return Ok(());
        };
        let target = Path::new(out).join(db);
        std::fs::create_dir_all(&target)?;
        let files = self.dump_files.lock().map(|f| f.clone()).unwrap_or_default();
        for (name, bytes) in files {
            let path = target.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)?;
        }
        Ok(())
    }

    fn capture_restore(&self, args: &[String]) -> std::io::Result<()> {
        // mongorestore's source directory is the only positional argument
        let source = args
            .iter()
            .enumerate()
            .find(|(i, a)| !a.starts_with("--") && (*i == 0 || !args[i - 1].starts_with("--")))
            .map(|(_, a)| PathBuf::from(a));
        let Some(source) = source else { return Ok(()) };

        let mut captured = BTreeMap::new();
        for entry in walkdir::WalkDir::new(&source) {
            let entry = entry.map_err(std::io::Error::other)?;
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(&source)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .into_owned();
                captured.insert(rel, std::fs::read(entry.path())?);
            }
        }
        if let Ok(mut restored) = self.restored.lock() {
            *restored = captured;
        }
        Ok(())
    }
}

fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((program.to_string(), args.to_vec()));
        }

        match self.outcome_for(program, args) {
            Some(Outcome::Missing) => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{program}: not found"),
            )),
            Some(Outcome::Exit { code, stderr }) => Ok(CommandOutput {
                status: Some(code),
                stdout: String::new(),
                stderr,
            }),
            None => {
                let is_version = args.iter().any(|a| a == "--version");
                if !is_version && program == crate::tools::DUMP_TOOL {
                    self.emulate_dump(args)?;
                }
                if !is_version && program == crate::tools::RESTORE_TOOL {
                    self.capture_restore(args)?;
                }
                Ok(CommandOutput {
                    status: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
        }
    }
}
