//! Chain data model and the append-only result store.
//!
//! A chain is a non-empty sequence of steps where index 0 is the sink and the
//! last index is the deepest caller reached — the "source" end from the
//! report's point of view. Chains are deep-copied on insertion so a worker's
//! partial stack can never alias stored output.

use std::path::{Path, PathBuf};

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Truncation limit for code excerpts in rendered output.
const CODE_EXCERPT_LIMIT: usize = 100;

/// One node of a reported chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    /// Absolute path of the source file.
    pub file: PathBuf,
    /// Zero-based line of the call site.
    pub line: usize,
    /// Enclosing function name, or a placeholder such as `Sink Detection`
    /// or `Global/Anonymous`.
    pub func: String,
    /// The trimmed source line.
    pub code: String,
    /// Ordered human-readable notes from the call-site analyzer.
    #[serde(default)]
    pub analysis: Vec<String>,
}

/// A complete sink-to-source chain.
pub type Chain = Vec<ChainStep>;

/// Mutex-protected, append-only store of finished chains. The push is the
/// only synchronization point between trace workers and the report side.
#[derive(Debug, Default)]
pub struct ChainStore {
    chains: Mutex<Vec<Chain>>,
}

impl ChainStore {
    pub fn push(&self, chain: &[ChainStep]) {
        self.chains.lock().push(chain.to_vec());
    }

    pub fn len(&self) -> usize {
        self.chains.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.lock().is_empty()
    }

    /// Copy of everything recorded so far, in completion order.
    pub fn snapshot(&self) -> Vec<Chain> {
        self.chains.lock().clone()
    }
}

/// Render one chain as markdown, source first, for terminal output and the
/// external report.
pub fn chain_to_markdown(chain: &[ChainStep], project_root: &Path) -> String {
    if chain.is_empty() {
        return String::new();
    }
    let mut md = String::new();
    md.push_str(&format!("## 🔥 Vulnerability Chain ({} steps)\n\n", chain.len()));

    for (idx, step) in chain.iter().enumerate().rev() {
        let tag = if idx == chain.len() - 1 {
            "🟥 SOURCE"
        } else if idx == 0 {
            "💀 SINK"
        } else {
            "🔸 STEP"
        };

        let display_path = step
            .file
            .strip_prefix(project_root)
            .unwrap_or(&step.file)
            .display();

        md.push_str(&format!("### {} `{}`\n\n", tag, step.func));
        md.push_str(&format!("- **File**: `{}:{}`\n", display_path, step.line + 1));
        if !step.code.is_empty() {
            let mut code = step.code.trim().to_string();
            if code.chars().count() > CODE_EXCERPT_LIMIT {
                code = code.chars().take(CODE_EXCERPT_LIMIT).collect::<String>() + "...";
            }
            md.push_str(&format!("- **Code**: `{code}`\n"));
        }
        for note in &step.analysis {
            md.push_str(&format!("- {note}\n"));
        }
        md.push('\n');
        if idx > 0 {
            md.push_str("↓\n\n");
        }
    }

    md
}

/// Serialize the chain list as pretty JSON: the shape the report renderer
/// consumes.
pub fn chains_to_json(chains: &[Chain]) -> Result<String> {
    Ok(serde_json::to_string_pretty(chains)?)
}
