//! Lightweight call-site classification.
//!
//! For each chain step the engine attaches human-readable notes about the
//! argument being passed: a compile-time constant, a nearby local definition,
//! or a parameter of the enclosing method. These notes are hints for triage
//! only; they never steer the traversal.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::rules::SinkRule;

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[^"]*""#).expect("string literal pattern is valid"));
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+(\.\d+)?$").expect("number pattern is valid"));
static NEW_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"new\s+([A-Z][A-Za-z0-9_$]*)").expect("new-type pattern is valid"));
static RECEIVER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z0-9_$]+)$").expect("receiver pattern is valid"));

/// How far back to look for a local assignment of the argument.
const DEFINITION_LOOKBACK: usize = 50;
/// How far back to look for the enclosing method's signature line.
const SIGNATURE_LOOKBACK: usize = 100;

/// Notes attached to one call site.
#[derive(Debug, Clone, Default)]
pub struct CallSiteAnalysis {
    /// The trimmed source line.
    pub code: String,
    /// Ordered human-readable observations.
    pub data_flow: Vec<String>,
}

/// Read the call site at `(path, line)` and classify the argument passed to
/// the call, using `target_func` to recognize method parameters.
pub fn analyze_call_site(path: &Path, line: usize, target_func: &str) -> CallSiteAnalysis {
    let Ok(content) = std::fs::read_to_string(path) else {
        return CallSiteAnalysis::default();
    };
    let lines: Vec<&str> = content.lines().collect();
    if line >= lines.len() {
        return CallSiteAnalysis::default();
    }

    let code = lines[line].trim().to_string();
    let mut data_flow = Vec::new();

    let args = extract_args(&code);
    if !args.is_empty() && !is_strict_constant(&args) {
        if let Some(definition) = find_definition(&lines, line, &args) {
            let value = extract_rhs(&definition);
            if is_strict_constant(&value) {
                data_flow.push(format!("🟢 Defined as Constant: `{}`", value.trim()));
            } else {
                data_flow.push(format!("⚠️ Variable Definition: `{}`", value.trim()));
            }
        } else {
            // The name may be "download" or "download(String)".
            let simple = target_func.split('(').next().unwrap_or(target_func);
            if !simple.is_empty() && is_method_parameter(&lines, line, simple, &args) {
                data_flow.push(format!("⚠️ Variable Definition: Method Parameter `{args}`"));
            }
        }
    }

    CallSiteAnalysis { code, data_flow }
}

/// Extract the argument list of the last call on the line: the contents of
/// the parenthesis group that closes last. Chained receivers resolve to the
/// final call's arguments, so `Runtime.getRuntime().exec(cmd)` yields `cmd`.
/// A line whose argument list continues past the end yields an empty string.
pub fn extract_args(code: &str) -> String {
    let Some(close) = code.rfind(')') else {
        return String::new();
    };
    let mut depth = 1usize;
    let bytes = code.as_bytes();
    for idx in (0..close).rev() {
        match bytes[idx] {
            b')' => depth += 1,
            b'(' => {
                depth -= 1;
                if depth == 0 {
                    return code[idx + 1..close].trim().to_string();
                }
            }
            _ => {}
        }
    }
    String::new()
}

/// Strict constant decision on an expression string.
///
/// Empty strings, numbers, `true`/`false`/`null`, and `.class` literals are
/// constants. Anything without a string literal is not. Otherwise the string
/// literals are removed; if only `+` and whitespace remain, the expression is
/// a pure concatenation of literals.
pub fn is_strict_constant(expr: &str) -> bool {
    let expr = expr.trim();
    if expr.is_empty() {
        return true;
    }
    if NUMBER.is_match(expr) || expr == "true" || expr == "false" || expr == "null" {
        return true;
    }
    if expr.ends_with(".class") {
        return true;
    }
    if !expr.contains('"') {
        return false;
    }
    let without_literals = STRING_LITERAL.replace_all(expr, "");
    without_literals
        .chars()
        .all(|c| c == '+' || c.is_whitespace())
}

/// Right-hand side of an assignment, without the trailing semicolon.
pub fn extract_rhs(code: &str) -> String {
    match code.split_once('=') {
        Some((_, rhs)) => rhs.trim().trim_end_matches(';').trim().to_string(),
        None => code.to_string(),
    }
}

/// Whether the trimmed line is a comment.
pub fn is_comment_line(text: &str) -> bool {
    text.starts_with("//") || text.starts_with('*') || text.starts_with("/*")
}

/// Search the previous lines for an assignment to `var_name` and return the
/// assignment line. Comment lines are skipped.
pub fn find_definition(lines: &[&str], current_line: usize, var_name: &str) -> Option<String> {
    let start = current_line.checked_sub(1)?;
    let limit = current_line.saturating_sub(DEFINITION_LOOKBACK);
    let pattern = Regex::new(&format!(r"\b{}\s*=", regex::escape(var_name))).ok()?;

    for idx in (limit..=start).rev() {
        let text = lines[idx].trim();
        if is_comment_line(text) {
            continue;
        }
        if pattern.is_match(text) {
            return Some(text.to_string());
        }
    }
    None
}

/// Whether `var_name` appears in the signature of `func_name` above the call
/// site. A line ending in `;` is a call, not a definition, and is skipped.
pub fn is_method_parameter(
    lines: &[&str],
    current_line: usize,
    func_name: &str,
    var_name: &str,
) -> bool {
    let Ok(word) = Regex::new(&format!(r"\b{}\b", regex::escape(var_name))) else {
        return false;
    };
    for idx in (0..=current_line).rev() {
        if current_line - idx > SIGNATURE_LOOKBACK {
            break;
        }
        let line = lines[idx].trim();
        if line.contains(func_name) && line.contains('(') {
            if line.ends_with(';') {
                continue;
            }
            return word.is_match(line);
        }
    }
    false
}

/// Conservative veto: the candidate's receiver obviously cannot be the
/// rule's class. Catches static-only rules invoked through a variable and
/// the Stream vs Writer/Reader split; anything uncertain passes.
pub fn is_type_mismatch(code: &str, rule: &SinkRule, lines: &[&str], current_line: usize) -> bool {
    let Some(dot) = code.find('.') else {
        return false;
    };
    let receiver = code[..dot].trim_end();
    let Some(var_match) = RECEIVER.find(receiver) else {
        return false;
    };
    let var_name = var_match.as_str();

    if rule.is_static && var_name != rule.short_class() && var_name != rule.class_name {
        return true;
    }

    let Some(definition) = find_definition(lines, current_line, var_name) else {
        return false;
    };

    // Declared type: "Type var = ..." or "var = new Type(...)".
    let mut declared: Option<String> = None;
    let tokens: Vec<&str> = definition.split_whitespace().collect();
    for (idx, token) in tokens.iter().enumerate() {
        let clean = token.trim_matches(|c| c == ';' || c == '=');
        if clean == var_name && idx > 0 && !is_java_modifier(tokens[idx - 1]) {
            declared = Some(tokens[idx - 1].to_string());
            break;
        }
    }
    if declared.is_none() {
        if let Some(captures) = NEW_TYPE.captures(&definition) {
            declared = Some(captures[1].to_string());
        }
    }
    let Some(mut declared) = declared else {
        return false;
    };
    if let Some(generic) = declared.find('<') {
        declared.truncate(generic);
    }

    let rule_short = rule.short_class();
    let declared_stream = declared.ends_with("Stream");
    let declared_writer = declared.ends_with("Writer") || declared.ends_with("Reader");
    let rule_stream = rule_short.ends_with("Stream");
    let rule_writer = rule_short.ends_with("Writer") || rule_short.ends_with("Reader");

    (declared_stream && rule_writer) || (declared_writer && rule_stream)
}

fn is_java_modifier(token: &str) -> bool {
    matches!(
        token,
        "final" | "static" | "private" | "public" | "protected" | "volatile" | "transient"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{builtin_rules, Severity, SinkRule};

    fn rule(class_name: &str, method_name: &str, is_static: bool) -> SinkRule {
        let mut rule = SinkRule {
            name: String::new(),
            vuln_type: "TEST".to_string(),
            desc: "test".to_string(),
            severity: Severity::Medium,
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            skip_safe: false,
            is_static,
            pattern: None,
        };
        rule.compile().unwrap();
        rule
    }

    #[test]
    fn test_extract_args_chained_receiver() {
        assert_eq!(extract_args(r#"Runtime.getRuntime().exec("ls");"#), r#""ls""#);
        assert_eq!(extract_args("Runtime.getRuntime().exec(cmd);"), "cmd");
    }

    #[test]
    fn test_extract_args_nested_and_open_calls() {
        assert_eq!(extract_args("run(build(x))"), "build(x)");
        assert_eq!(extract_args("stmt.executeQuery(q)"), "q");
        // Argument list continues on the next line.
        assert_eq!(extract_args("exec(cmd +"), "");
        assert_eq!(extract_args("no parens here"), "");
    }

    #[test]
    fn test_strict_constant_table() {
        assert!(is_strict_constant(""));
        assert!(is_strict_constant("42"));
        assert!(is_strict_constant("-3.5"));
        assert!(is_strict_constant("true"));
        assert!(is_strict_constant("null"));
        assert!(is_strict_constant("Foo.class"));
        assert!(is_strict_constant(r#""ls""#));
        assert!(is_strict_constant(r#""a" + "b""#));
        assert!(!is_strict_constant("cmd"));
        assert!(!is_strict_constant(r#""rm -rf " + dir"#));
        assert!(!is_strict_constant(r#"req.getParameter("c")"#));
    }

    #[test]
    fn test_strict_constant_whitespace_stability() {
        for expr in [r#""a"+"b""#, "42", "Foo.class", "cmd"] {
            let padded = format!("   {expr}  ");
            assert_eq!(is_strict_constant(expr), is_strict_constant(&padded), "{expr}");
        }
    }

    #[test]
    fn test_extract_rhs() {
        assert_eq!(extract_rhs(r#"String cmd = req.getParameter("c");"#), r#"req.getParameter("c")"#);
        assert_eq!(extract_rhs("no assignment"), "no assignment");
    }

    #[test]
    fn test_find_definition_skips_comments() {
        let lines = vec![
            "String cmd = input;",
            "// cmd = \"safe\";",
            "use(cmd);",
        ];
        let found = find_definition(&lines, 2, "cmd").unwrap();
        assert_eq!(found, "String cmd = input;");
    }

    #[test]
    fn test_method_parameter_detection() {
        let lines = vec![
            "public String download(String url) throws IOException {",
            "    client.fetch(url);",
            "}",
        ];
        assert!(is_method_parameter(&lines, 1, "download", "url"));
        assert!(!is_method_parameter(&lines, 1, "download", "body"));
    }

    #[test]
    fn test_method_parameter_skips_invocations() {
        let lines = vec![
            "public void download(String url) {",
            "    helper.download(other);",
            "    sink(url);",
        ];
        // Line 1 is a call (ends with ';'), so the definition on line 0 wins.
        assert!(is_method_parameter(&lines, 2, "download", "url"));
    }

    #[test]
    fn test_analyze_call_site_variable_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("A.java");
        std::fs::write(
            &path,
            concat!(
                "public class A {\n",
                "    public void run(HttpServletRequest req) throws Exception {\n",
                "        String cmd = req.getParameter(\"c\");\n",
                "        Runtime.getRuntime().exec(cmd);\n",
                "    }\n",
                "}\n",
            ),
        )
        .unwrap();

        let result = analyze_call_site(&path, 3, "run");
        assert_eq!(result.code, "Runtime.getRuntime().exec(cmd);");
        assert_eq!(result.data_flow.len(), 1);
        assert!(result.data_flow[0].starts_with("⚠️ Variable Definition:"));
        assert!(result.data_flow[0].contains("req.getParameter"));
    }

    #[test]
    fn test_analyze_call_site_constant_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("B.java");
        std::fs::write(
            &path,
            concat!(
                "public class B {\n",
                "    void go() throws Exception {\n",
                "        String cmd = \"ls\" + \"-la\";\n",
                "        Runtime.getRuntime().exec(cmd);\n",
                "    }\n",
                "}\n",
            ),
        )
        .unwrap();

        let result = analyze_call_site(&path, 3, "go");
        assert_eq!(result.data_flow.len(), 1);
        assert!(result.data_flow[0].starts_with("🟢 Defined as Constant:"));
    }

    #[test]
    fn test_type_mismatch_static_receiver() {
        let files_write = builtin_rules()
            .into_iter()
            .find(|r| r.class_name == "java.nio.file.Files" && r.method_name == "write")
            .unwrap();
        let lines = vec!["helper.write(path, data);"];
        assert!(is_type_mismatch("helper.write(path, data);", &files_write, &lines, 0));
        let lines = vec!["Files.write(path, data);"];
        assert!(!is_type_mismatch("Files.write(path, data);", &files_write, &lines, 0));
    }

    #[test]
    fn test_type_mismatch_stream_vs_writer() {
        let writer_rule = rule("java.io.PrintWriter", "write", false);
        let lines = vec![
            "BufferedOutputStream bos = new BufferedOutputStream(raw);",
            "bos.write(data);",
        ];
        assert!(is_type_mismatch("bos.write(data);", &writer_rule, &lines, 1));

        let lines = vec!["PrintWriter out = response.getWriter();", "out.write(data);"];
        assert!(!is_type_mismatch("out.write(data);", &writer_rule, &lines, 1));
    }
}
