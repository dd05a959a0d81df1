//! Sink discovery and verification.
//!
//! A scan is three passes overlaid: a textual sweep of the tree against the
//! rule patterns, an LSP `textDocument/definition` check that the matched
//! identifier really resolves to the rule's class (with an import-scan
//! fallback for source-only indexes), and a reverse trace launched per
//! confirmed sink under a counting semaphore.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::analysis::{analyze_call_site, extract_args, is_comment_line, is_strict_constant, is_type_mismatch};
use crate::chains::ChainStep;
use crate::protocol::Location;
use crate::rules::SinkRule;
use crate::tracer::Tracer;
use crate::uri::{is_java_file, to_uri};

/// A textual hit before verification.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub file: PathBuf,
    /// Zero-based line of the match.
    pub line: usize,
    /// Byte offset of the match start within the line.
    pub column: usize,
    /// The trimmed source line.
    pub code: String,
    pub rule: SinkRule,
}

/// Directories that never contain project sources worth scanning.
fn is_scannable(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    !(name.starts_with('.') || name == "target" || name == "build" || name == "node_modules")
}

/// Walk the tree and collect one candidate per (line, rule) pattern match.
/// Comment lines are skipped; `skip_safe` rules drop matches whose argument
/// list is a compile-time constant.
pub fn find_candidates(root: &Path, rules: &[SinkRule]) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(is_scannable)
        .filter_map(|entry| entry.ok())
    {
        if !entry.file_type().is_file() || !is_java_file(entry.path()) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };

        for (line_number, raw) in content.lines().enumerate() {
            let line = raw.trim_end();
            let trimmed = line.trim_start();
            if trimmed.is_empty() || is_comment_line(trimmed) {
                continue;
            }

            for rule in rules {
                let Some(pattern) = rule.pattern.as_ref() else {
                    continue;
                };
                let Some(matched) = pattern.find(line) else {
                    continue;
                };
                if rule.skip_safe && is_strict_constant(&extract_args(&line[matched.start()..])) {
                    continue;
                }
                candidates.push(Candidate {
                    file: entry.path().to_path_buf(),
                    line: line_number,
                    column: matched.start(),
                    code: trimmed.to_string(),
                    rule: rule.clone(),
                });
            }
        }
    }

    candidates
}

/// Scan a Java file's import block for the class, either verbatim or through
/// a star import of its package. Stops at the first type declaration.
pub fn has_import(file: &Path, class_name: &str) -> bool {
    let Ok(content) = std::fs::read_to_string(file) else {
        return false;
    };
    let Some(split) = class_name.rfind('.') else {
        return false;
    };
    let package = &class_name[..split];

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with("import ") {
            if line.contains(class_name) {
                return true;
            }
            if line.contains(&format!("{package}.*")) {
                return true;
            }
        }
        if line.contains("class ") || line.contains("interface ") {
            break;
        }
    }
    false
}

impl Tracer {
    /// Decide whether a candidate really invokes the rule's class.
    ///
    /// `textDocument/definition` is queried one character past the match
    /// start so the cursor lands inside the identifier rather than on the
    /// preceding dot. The result classifies as:
    /// - strong positive: a URI carries the slash form of the class or its
    ///   short name;
    /// - strong negative: a binary artifact URI (`.class`, `jdt:`, `jar:`)
    ///   that did not match — a different library class;
    /// - anything else (local source file, empty, timeout): fall through to
    ///   the import scan, then to a verbatim fully-qualified-name check.
    pub async fn verify_sink(&self, candidate: &Candidate) -> bool {
        let params = json!({
            "textDocument": {"uri": to_uri(&candidate.file)},
            "position": {"line": candidate.line, "character": candidate.column + 1},
        });
        let outcome = self
            .client
            .request("textDocument/definition", params, self.options.definition_timeout)
            .await;

        if let Ok(value) = outcome {
            if !value.is_null() {
                let slash_form = candidate.rule.class_name.replace('.', "/");
                let short_name = candidate.rule.short_class();
                let uris: Vec<String> = match serde_json::from_value::<Vec<Location>>(value.clone())
                {
                    Ok(locations) if !locations.is_empty() => {
                        locations.into_iter().map(|l| l.uri).collect()
                    }
                    Ok(_) => Vec::new(),
                    // Not a plain location list (e.g. LocationLink); fall back
                    // to matching against the raw payload.
                    Err(_) => vec![value.to_string()],
                };

                let mut saw_binary = false;
                for uri in &uris {
                    if uri.contains(&slash_form) || uri.contains(short_name) {
                        return true;
                    }
                    if uri.contains(".class") || uri.contains("jdt:") || uri.contains("jar:") {
                        saw_binary = true;
                    }
                }
                if saw_binary {
                    return false;
                }
            }
        }

        if has_import(&candidate.file, &candidate.rule.class_name) {
            return true;
        }
        // Fully qualified invocations need no import.
        candidate.code.contains(&candidate.rule.class_name)
    }

    /// Receiver-type veto on a confirmed candidate (see
    /// `analysis::is_type_mismatch`).
    fn is_receiver_mismatch(&self, candidate: &Candidate) -> bool {
        let Ok(content) = std::fs::read_to_string(&candidate.file) else {
            return false;
        };
        let lines: Vec<&str> = content.lines().collect();
        is_type_mismatch(&candidate.code, &candidate.rule, &lines, candidate.line)
    }

    /// Full scan: find candidates, verify each, and launch one bounded trace
    /// per confirmed sink. Returns when every trace has finished.
    pub async fn scan_and_trace(self: Arc<Self>, rules: &[SinkRule]) -> Result<()> {
        info!("scanning {} for risky sinks", self.project_root.display());
        let candidates = find_candidates(&self.project_root, rules);
        info!(candidates = candidates.len(), "text sweep done, verifying with the language server");

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_traces.max(1)));
        let mut traces: JoinSet<()> = JoinSet::new();
        let mut processed: HashSet<String> = HashSet::new();
        let mut confirmed = 0usize;

        for candidate in candidates {
            let sink_key = format!("{}:{}", candidate.file.display(), candidate.line);
            if !processed.insert(sink_key) {
                continue;
            }
            if !self.verify_sink(&candidate).await {
                debug!(code = %candidate.code, "candidate rejected");
                continue;
            }
            if self.is_receiver_mismatch(&candidate) {
                debug!(code = %candidate.code, "candidate vetoed: receiver type mismatch");
                continue;
            }
            confirmed += 1;
            info!(
                file = %candidate.file.display(),
                line = candidate.line + 1,
                rule = %candidate.rule.name,
                "confirmed sink: {}",
                candidate.code
            );

            let mut first_step = ChainStep {
                file: candidate.file.clone(),
                line: candidate.line,
                func: "Sink Detection".to_string(),
                code: candidate.code.clone(),
                analysis: vec![format!("🚨 Matched Rule: {}", candidate.rule.name)],
            };

            // The enclosing function comes first so the call-site analyzer
            // can recognize method parameters.
            let enclosing = self.enclosing_function(&candidate.file, candidate.line).await;
            let func_name = enclosing.as_ref().map(|f| f.name.clone()).unwrap_or_default();
            let call_site = analyze_call_site(&candidate.file, candidate.line, &func_name);
            first_step.analysis.extend(call_site.data_flow);

            match enclosing {
                Some(function) => {
                    first_step.func = function.name.clone();
                    let permit = Arc::clone(&semaphore).acquire_owned().await?;
                    let tracer = Arc::clone(&self);
                    let file = candidate.file.clone();
                    traces.spawn(async move {
                        let _permit = permit;
                        let mut visited = HashSet::new();
                        tracer
                            .trace_chain(
                                file,
                                function.start_line,
                                function.column,
                                vec![first_step],
                                &mut visited,
                            )
                            .await;
                    });
                }
                // Orphan sinks still go through the result store so strict
                // mode can judge them.
                None => self.record_result(&[first_step]).await,
            }
        }

        info!("waiting for {} running traces", traces.len());
        while let Some(joined) = traces.join_next().await {
            if let Err(err) = joined {
                warn!("trace task failed: {err}");
            }
        }

        if confirmed == 0 {
            info!("no confirmed sinks found");
        } else {
            info!(
                sinks = confirmed,
                chains = self.results.len(),
                "scan finished"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::builtin_rules;
    use std::fs;

    #[test]
    fn test_find_candidates_skips_constant_arguments() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("A.java"),
            concat!(
                "public class A {\n",
                "    void safe() throws Exception {\n",
                "        Runtime.getRuntime().exec(\"ls\");\n",
                "    }\n",
                "    void risky(String cmd) throws Exception {\n",
                "        Runtime.getRuntime().exec(cmd);\n",
                "    }\n",
                "}\n",
            ),
        )
        .unwrap();

        let rules = builtin_rules();
        let candidates = find_candidates(dir.path(), &rules);
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert_eq!(candidate.line, 5);
        assert_eq!(candidate.code, "Runtime.getRuntime().exec(cmd);");
        // The pattern matches the stored code and the column stays inside
        // the line.
        let pattern = candidate.rule.pattern.as_ref().unwrap();
        assert!(pattern.is_match(&candidate.code));
        assert!(candidate.column < "        Runtime.getRuntime().exec(cmd);".len());
    }

    #[test]
    fn test_find_candidates_skips_comments_and_build_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("B.java"),
            "// Runtime.getRuntime().exec(cmd);\n* stmt.executeQuery(q);\n",
        )
        .unwrap();
        let target = dir.path().join("target");
        fs::create_dir(&target).unwrap();
        fs::write(
            target.join("Gen.java"),
            "class Gen { void f(String c) throws Exception { Runtime.getRuntime().exec(c); } }\n",
        )
        .unwrap();
        let hidden = dir.path().join(".cache");
        fs::create_dir(&hidden).unwrap();
        fs::write(
            hidden.join("C.java"),
            "class C { void f(String c) throws Exception { Runtime.getRuntime().exec(c); } }\n",
        )
        .unwrap();

        let candidates = find_candidates(dir.path(), &builtin_rules());
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_has_import_exact_and_star() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Dao.java");
        fs::write(
            &file,
            concat!(
                "package com.example;\n",
                "import java.sql.Statement;\n",
                "import org.apache.http.client.*;\n",
                "public class Dao {\n",
                "    // import javax.script.ScriptEngine; (too late, inside the class)\n",
                "}\n",
            ),
        )
        .unwrap();

        assert!(has_import(&file, "java.sql.Statement"));
        assert!(has_import(&file, "org.apache.http.client.HttpClient"));
        assert!(!has_import(&file, "javax.script.ScriptEngine"));
        assert!(!has_import(&file, "NoPackage"));
    }
}
