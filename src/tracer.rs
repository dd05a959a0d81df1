//! Reverse chain tracer: from a confirmed sink backwards through
//! `textDocument/references` until a framework entry point is reached,
//! references run out, or a cycle closes.
//!
//! Framework entries are recognized purely textually: a closed list of
//! annotations and supertype phrases anywhere in the file above the visited
//! line. Strict mode additionally drops chains whose outermost frame has no
//! plausible untrusted-input surface.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analysis::{analyze_call_site, is_comment_line};
use crate::chains::{ChainStep, ChainStore};
use crate::client::LspClient;
use crate::protocol::{DocumentSymbol, Location};
use crate::uri::{from_uri, is_java_file, normalize_path, to_uri};

/// Annotations and supertype phrases that mark a function as reachable from
/// outside the process: web endpoints, servlets/filters, message listeners.
/// Deliberately excludes internal wiring (`@Component`, `@Service`) and
/// lifecycle hooks (`@PostConstruct`, `@Scheduled`).
pub const ENTRY_MARKERS: &[&str] = &[
    "@RequestMapping",
    "@GetMapping",
    "@PostMapping",
    "@PutMapping",
    "@DeleteMapping",
    "@PatchMapping",
    "@Controller",
    "@RestController",
    "@WebFilter",
    "@WebServlet",
    "implements Filter",
    "extends HttpServlet",
    "extends GenericServlet",
    "@RabbitListener",
    "@KafkaListener",
    "@JmsListener",
];

/// Ways a parameterless handler can still read attacker input.
pub const IMPLICIT_INPUT_MARKERS: &[&str] = &[
    "RequestContextHolder",
    "ServletRequestAttributes",
    "HttpServletRequest",
    "SecurityContextHolder",
    "request.getParameter",
    "request.getHeader",
    "request.getCookie",
    "MultipartHttpServletRequest",
];

const REFERENCE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Tuning knobs for one scan.
#[derive(Debug, Clone)]
pub struct TracerOptions {
    /// Keep only chains that terminate at a framework entry with a plausible
    /// input surface.
    pub strict_mode: bool,
    /// Share one visited set across all traces instead of scoping it per
    /// chain. Faster on huge trees; loses chains whose intermediate frames
    /// were first reached from another sink.
    pub shared_visited: bool,
    /// Concurrent trace cap.
    pub max_concurrent_traces: usize,
    pub symbol_timeout: Duration,
    pub definition_timeout: Duration,
    pub reference_timeout: Duration,
    pub reference_retries: usize,
    pub ready_timeout: Duration,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            strict_mode: false,
            shared_visited: false,
            max_concurrent_traces: 8,
            symbol_timeout: Duration::from_secs(3),
            definition_timeout: Duration::from_secs(3),
            reference_timeout: Duration::from_secs(2),
            reference_retries: 3,
            ready_timeout: Duration::from_secs(15),
        }
    }
}

/// A resolved enclosing function: where it is declared and where its body ends.
#[derive(Debug, Clone)]
pub struct EnclosingFunction {
    pub name: String,
    /// Zero-based line of the name token.
    pub start_line: usize,
    /// Zero-based last line of the body.
    pub end_line: usize,
    /// Character column of the name token.
    pub column: usize,
}

/// Owns the scan-wide state: the LSP client handle, the per-file symbol
/// cache, and the result store. Lives for exactly one scan.
pub struct Tracer {
    pub(crate) client: Arc<LspClient>,
    pub(crate) project_root: PathBuf,
    pub(crate) options: TracerOptions,
    /// Lazily populated `documentSymbol` trees keyed by normalized path.
    /// Never invalidated during a run; concurrent same-key writes are benign.
    symbol_cache: DashMap<PathBuf, Arc<Vec<DocumentSymbol>>>,
    pub results: ChainStore,
    /// Backing set for the `shared_visited` option.
    shared_visited: Mutex<HashSet<String>>,
}

struct Frame {
    file: PathBuf,
    line: usize,
    col: usize,
    stack: Vec<ChainStep>,
}

impl Tracer {
    pub fn new(client: Arc<LspClient>, project_root: PathBuf, options: TracerOptions) -> Self {
        Self {
            client,
            project_root,
            options,
            symbol_cache: DashMap::new(),
            results: ChainStore::default(),
            shared_visited: Mutex::new(HashSet::new()),
        }
    }

    /// Run the startup handshake in source-only mode: build-system import is
    /// disabled so the server indexes the tree without resolving
    /// dependencies, then block until the index is ready.
    pub async fn initialize(&self, anchor_file: &Path) -> anyhow::Result<()> {
        info!("initializing language server (source-only mode)");
        let root_uri = to_uri(&self.project_root);
        let java_home = std::env::var("JAVA_HOME").unwrap_or_else(|_| ".".to_string());

        let java_settings = json!({
            "home": java_home,
            "errors": {"incompleteClasspath": {"severity": "ignore"}},
            "configuration": {
                "runtimes": [
                    {"name": "JavaSE-1.8", "path": java_home, "default": true},
                    {"name": "JavaSE-11", "path": java_home, "default": true},
                    {"name": "JavaSE-17", "path": java_home, "default": true},
                ]
            },
            "import": {
                "gradle": {"enabled": false},
                "maven": {"enabled": false},
                "exclusions": ["**/pom.xml", "**/build.gradle"],
            }
        });

        let init_params = json!({
            "rootUri": root_uri,
            "workspaceFolders": [{"uri": root_uri, "name": "Target"}],
            "capabilities": {
                "workspace": {
                    "applyEdit": true,
                    "workspaceFolders": true,
                    "configuration": true,
                    "didChangeConfiguration": {"dynamicRegistration": true},
                },
                "textDocument": {
                    "synchronization": {"didOpen": true, "didSave": true},
                    "documentSymbol": {"hierarchicalDocumentSymbolSupport": true},
                    "references": {"dynamicRegistration": true},
                }
            },
            "initializationOptions": {
                "bundles": [],
                "extendedClientCapabilities": {"progressReportProvider": true},
                "settings": {"java": java_settings.clone()},
            }
        });

        if let Err(err) = self
            .client
            .request("initialize", init_params, Duration::from_secs(10))
            .await
        {
            warn!("initialize did not complete cleanly: {err}");
        }
        self.client.send_notification("initialized", json!({})).await?;
        self.client
            .send_notification(
                "workspace/didChangeConfiguration",
                json!({"settings": {"java": java_settings}}),
            )
            .await?;
        self.did_open(anchor_file).await?;

        info!("waiting for the language server index");
        self.client
            .wait_for_service_ready(self.options.ready_timeout)
            .await?;
        info!("index ready");
        Ok(())
    }

    /// Activate per-file indexing for one document.
    pub async fn did_open(&self, path: &Path) -> anyhow::Result<()> {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Ok(());
        };
        self.client
            .send_notification(
                "textDocument/didOpen",
                json!({
                    "textDocument": {
                        "uri": to_uri(path),
                        "languageId": "java",
                        "version": 1,
                        "text": content,
                    }
                }),
            )
            .await
    }

    /// Resolve the innermost method-like symbol spanning `line`, fetching and
    /// caching the file's symbol tree on first use.
    pub async fn enclosing_function(&self, file: &Path, line: usize) -> Option<EnclosingFunction> {
        let key = normalize_path(file);
        if let Some(cached) = self.symbol_cache.get(&key) {
            let symbols = Arc::clone(cached.value());
            return deepest_method_like(&symbols, line);
        }

        let params = json!({"textDocument": {"uri": to_uri(file)}});
        let value = self
            .client
            .request("textDocument/documentSymbol", params, self.options.symbol_timeout)
            .await
            .ok()?;
        let symbols: Vec<DocumentSymbol> = if value.is_null() {
            Vec::new()
        } else {
            serde_json::from_value(value).unwrap_or_default()
        };
        // Racing workers may insert the same tree twice; last writer wins
        // with equal data.
        let symbols = Arc::new(symbols);
        self.symbol_cache.insert(key, Arc::clone(&symbols));
        deepest_method_like(&symbols, line)
    }

    /// `textDocument/references` with retry: the server sometimes answers
    /// empty while its index is still settling for a file.
    pub(crate) async fn references_with_retry(
        &self,
        file: &Path,
        line: usize,
        col: usize,
    ) -> Vec<Location> {
        let uri = to_uri(file);
        for attempt in 0..self.options.reference_retries.max(1) {
            let params = json!({
                "textDocument": {"uri": uri},
                "position": {"line": line, "character": col},
                "context": {"includeDeclaration": true},
            });
            let refs: Vec<Location> = match self
                .client
                .request("textDocument/references", params, self.options.reference_timeout)
                .await
            {
                Ok(value) if !value.is_null() => serde_json::from_value(value).unwrap_or_default(),
                _ => Vec::new(),
            };

            let valid: Vec<Location> = refs
                .into_iter()
                .filter(|reference| self.is_valid_reference(reference, file, line))
                .collect();
            if !valid.is_empty() {
                return valid;
            }
            if attempt + 1 < self.options.reference_retries {
                tokio::time::sleep(REFERENCE_RETRY_DELAY).await;
            }
        }
        Vec::new()
    }

    /// A reference is usable iff it lands in a Java file and is not the
    /// declaration itself (same file within one line of the query).
    fn is_valid_reference(&self, reference: &Location, file: &Path, line: usize) -> bool {
        let path = from_uri(&reference.uri);
        if !is_java_file(&path) {
            return false;
        }
        let same_file = normalize_path(&path) == normalize_path(file);
        let near = reference.range.start.line.abs_diff(line) <= 1;
        !(same_file && near)
    }

    /// Walk the reverse call graph from `(file, line, col)`, carrying the
    /// partial chain in `stack`. Depth-first over an explicit worklist; the
    /// visited set prevents revisiting a call site within the chain.
    pub async fn trace_chain(
        &self,
        file: PathBuf,
        line: usize,
        col: usize,
        stack: Vec<ChainStep>,
        visited: &mut HashSet<String>,
    ) {
        let mut worklist = vec![Frame { file, line, col, stack }];

        while let Some(frame) = worklist.pop() {
            if is_framework_entry(&frame.file, frame.line) {
                self.record_result(&frame.stack).await;
                continue;
            }

            let references = self
                .references_with_retry(&frame.file, frame.line, frame.col)
                .await;
            if references.is_empty() {
                self.record_result(&frame.stack).await;
                continue;
            }

            let mut advanced = false;
            for reference in references {
                let caller_path = from_uri(&reference.uri);
                let caller_line = reference.range.start.line;
                let key = format!("{}:{}", normalize_path(&caller_path).display(), caller_line);
                if !self.mark_visited(visited, key) {
                    continue;
                }
                advanced = true;

                let enclosing = self.enclosing_function(&caller_path, caller_line).await;
                let func_name = enclosing
                    .as_ref()
                    .map(|f| f.name.clone())
                    .unwrap_or_else(|| "Global/Anonymous".to_string());
                debug!(
                    caller = %func_name,
                    file = %caller_path.display(),
                    line = caller_line + 1,
                    "found caller"
                );

                let call_site = analyze_call_site(&caller_path, caller_line, &func_name);
                let step = ChainStep {
                    file: caller_path.clone(),
                    line: caller_line,
                    func: func_name,
                    code: call_site.code,
                    analysis: call_site.data_flow,
                };
                let mut next_stack = frame.stack.clone();
                next_stack.push(step);

                match enclosing {
                    Some(function) => worklist.push(Frame {
                        file: caller_path,
                        line: function.start_line,
                        col: function.column,
                        stack: next_stack,
                    }),
                    None => self.record_result(&next_stack).await,
                }
            }

            // Every reference was already explored: the cycle (or overlap)
            // closes here and the stack is a finished chain.
            if !advanced {
                self.record_result(&frame.stack).await;
            }
        }
    }

    fn mark_visited(&self, local: &mut HashSet<String>, key: String) -> bool {
        if self.options.shared_visited {
            self.shared_visited.lock().insert(key)
        } else {
            local.insert(key)
        }
    }

    /// Store a finished chain. In strict mode the outermost frame must itself
    /// be a framework entry and must have an input surface: either a
    /// non-empty parameter list or an implicit request accessor in its body.
    pub async fn record_result(&self, stack: &[ChainStep]) {
        let Some(source) = stack.last() else {
            return;
        };

        if self.options.strict_mode {
            if !is_framework_entry(&source.file, source.line) {
                debug!(func = %source.func, "dropping chain: source frame is not an entry point");
                return;
            }
            if let Some(function) = self.enclosing_function(&source.file, source.line).await {
                if !check_source_validity(&source.file, function.start_line, function.end_line) {
                    debug!(func = %function.name, "dropping chain: entry point has no input surface");
                    return;
                }
            }
        }

        self.results.push(stack);
        info!(
            steps = stack.len(),
            sink = %stack[0].code,
            source = %source.func,
            "recorded vulnerability chain"
        );
    }
}

/// Innermost method-like symbol spanning `line`. Outer matches are
/// overwritten as the walk descends, so the deepest wins.
pub fn deepest_method_like(nodes: &[DocumentSymbol], line: usize) -> Option<EnclosingFunction> {
    let mut found = None;
    walk_symbols(nodes, line, &mut found);
    found
}

fn walk_symbols(nodes: &[DocumentSymbol], line: usize, found: &mut Option<EnclosingFunction>) {
    for node in nodes {
        if !node.encloses_line(line) {
            continue;
        }
        if node.is_method_like() && !node.name.is_empty() {
            *found = Some(EnclosingFunction {
                name: node.name.clone(),
                start_line: node.selection_range.start.line,
                end_line: node.range.end.line,
                column: node.selection_range.start.character,
            });
        }
        if !node.children.is_empty() {
            walk_symbols(&node.children, line, found);
        }
    }
}

/// Whether any non-comment line from the top of the file through `line`
/// carries a framework entry marker. Scanning from line 0 catches class-level
/// annotations far above the call site.
pub fn is_framework_entry(file: &Path, line: usize) -> bool {
    let Ok(content) = std::fs::read_to_string(file) else {
        return false;
    };
    for text in content.lines().take(line + 1) {
        let text = text.trim();
        if is_comment_line(text) {
            continue;
        }
        if ENTRY_MARKERS.iter().any(|marker| text.contains(marker)) {
            return true;
        }
    }
    false
}

/// Whether the function spanning `start_line..=end_line` has an input
/// surface: parameters in its signature, or an implicit request accessor in
/// its body. Unreadable files keep the chain (fail open).
pub fn check_source_validity(file: &Path, start_line: usize, end_line: usize) -> bool {
    let Ok(content) = std::fs::read_to_string(file) else {
        return true;
    };
    let lines: Vec<&str> = content
        .lines()
        .skip(start_line)
        .take(end_line.saturating_sub(start_line) + 1)
        .collect();

    let mut signature = String::new();
    let mut body_start = 0;
    for (idx, line) in lines.iter().enumerate() {
        signature.push_str(line);
        signature.push(' ');
        if line.contains('{') {
            body_start = idx;
            break;
        }
    }

    if let (Some(open), Some(close)) = (signature.find('('), signature.rfind(')')) {
        if close > open && !signature[open + 1..close].trim().is_empty() {
            return true;
        }
    }

    let body = lines[body_start..].join("\n");
    IMPLICIT_INPUT_MARKERS.iter().any(|marker| body.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Position, Range};

    fn symbol(name: &str, kind: u32, start: usize, end: usize, sel: Position) -> DocumentSymbol {
        DocumentSymbol {
            name: name.to_string(),
            kind,
            range: Range {
                start: Position { line: start, character: 0 },
                end: Position { line: end, character: 1 },
            },
            selection_range: Range { start: sel, end: sel },
            children: Vec::new(),
        }
    }

    #[test]
    fn test_deepest_method_wins() {
        let mut class = symbol("Outer", 5, 0, 20, Position { line: 0, character: 6 });
        let mut method = symbol("run", 6, 2, 10, Position { line: 2, character: 16 });
        let lambda = symbol("lambda$0", 12, 4, 6, Position { line: 4, character: 8 });
        method.children.push(lambda);
        class.children.push(method);

        let found = deepest_method_like(&[class.clone()], 5).unwrap();
        assert_eq!(found.name, "lambda$0");

        let found = deepest_method_like(&[class.clone()], 8).unwrap();
        assert_eq!(found.name, "run");
        assert_eq!(found.start_line, 2);
        assert_eq!(found.column, 16);

        // Only the class spans line 15; nothing method-like applies.
        assert!(deepest_method_like(&[class], 15).is_none());
    }

    #[test]
    fn test_framework_entry_markers() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("C.java");
        std::fs::write(
            &entry,
            concat!(
                "public class C {\n",
                "    @PostMapping(\"/y\")\n",
                "    public void handle(String body) {\n",
                "    }\n",
                "}\n",
            ),
        )
        .unwrap();
        assert!(is_framework_entry(&entry, 2));
        // The annotation sits below the scanned window.
        assert!(!is_framework_entry(&entry, 0));

        let plain = dir.path().join("Util.java");
        std::fs::write(&plain, "public class Util {\n    void go() {}\n}\n").unwrap();
        assert!(!is_framework_entry(&plain, 2));
    }

    #[test]
    fn test_framework_entry_ignores_comments() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("D.java");
        std::fs::write(
            &file,
            concat!(
                "// @PostMapping in a comment does not count\n",
                "public class D {\n",
                "    void go() {}\n",
                "}\n",
            ),
        )
        .unwrap();
        assert!(!is_framework_entry(&file, 3));
    }

    #[test]
    fn test_source_validity_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("E.java");
        std::fs::write(
            &file,
            concat!(
                "public class E {\n",
                "    public void with(String arg) {\n",
                "        use(arg);\n",
                "    }\n",
                "    public void without() {\n",
                "        internal();\n",
                "    }\n",
                "    public void implicit() {\n",
                "        String c = request.getParameter(\"c\");\n",
                "    }\n",
                "}\n",
            ),
        )
        .unwrap();
        assert!(check_source_validity(&file, 1, 3));
        assert!(!check_source_validity(&file, 4, 6));
        assert!(check_source_validity(&file, 7, 9));
    }
}
