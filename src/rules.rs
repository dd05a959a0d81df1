//! Sink rule model and the built-in rule catalogue.
//!
//! A rule names one dangerous API: the fully qualified class, the method (or
//! `<init>` for constructors), and how to triage matches. The catalogue keeps
//! to the principle that a sink is the moment untrusted data is *consumed*
//! (`.exec`, `.executeQuery`, `.parse`), never a handle that merely could be
//! used later (constructing a `URL`, grabbing a `Connection`). Rules where a
//! compile-time-constant argument is obviously benign carry `skip_safe`;
//! deserializers do not, because even a constant stream may carry attacker
//! bytes from another layer.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Severity of a confirmed finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
        }
    }
}

/// Declarative description of one dangerous API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkRule {
    /// Display name; defaults to `"{vuln_type} ({ShortClass}.{method})"`.
    #[serde(default)]
    pub name: String,
    /// Taxonomy tag, e.g. `RCE` or `SQLI`.
    pub vuln_type: String,
    pub desc: String,
    pub severity: Severity,
    /// Fully qualified class name, e.g. `java.lang.Runtime`.
    pub class_name: String,
    /// Method name, or the literal `<init>` for constructors.
    pub method_name: String,
    /// Drop candidates whose argument list is a compile-time constant.
    #[serde(default)]
    pub skip_safe: bool,
    /// The method must be invoked through the type name itself.
    #[serde(default)]
    pub is_static: bool,
    /// Compiled line pattern, bound by `compile` before the rule is used.
    #[serde(skip)]
    pub pattern: Option<Regex>,
}

impl SinkRule {
    /// The class name without its package prefix.
    pub fn short_class(&self) -> &str {
        match self.class_name.rfind('.') {
            Some(idx) => &self.class_name[idx + 1..],
            None => &self.class_name,
        }
    }

    /// Bind the default name and the line pattern. Constructors match
    /// `new ShortClass(`, everything else matches `.method(`.
    pub fn compile(&mut self) -> Result<(), regex::Error> {
        let short = self.short_class().to_string();
        if self.name.is_empty() {
            self.name = format!("{} ({}.{})", self.vuln_type, short, self.method_name);
        }
        let pattern = if self.method_name == "<init>" {
            Regex::new(&format!(r"new\s+{}\s*\(", regex::escape(&short)))?
        } else {
            Regex::new(&format!(r"\.{}\s*\(", regex::escape(&self.method_name)))?
        };
        self.pattern = Some(pattern);
        Ok(())
    }
}

/// Parse a YAML rule document: a top-level sequence of rule mappings.
/// Unknown keys are ignored. An unparseable pattern aborts the load.
pub fn parse_rules(yaml: &str) -> Result<Vec<SinkRule>> {
    let mut rules: Vec<SinkRule> = serde_yml::from_str(yaml).context("invalid rule YAML")?;
    for rule in &mut rules {
        rule.compile().with_context(|| {
            format!("invalid pattern for rule on {}.{}", rule.class_name, rule.method_name)
        })?;
    }
    Ok(rules)
}

/// Load and compile rules from a YAML file.
pub fn load_rules_from_file(path: &Path) -> Result<Vec<SinkRule>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rule file {}", path.display()))?;
    parse_rules(&data)
}

/// Resolve the active rule set: an explicit path wins, then `rules.yaml` in
/// the working directory, then the built-in catalogue.
pub fn resolve_rules(explicit: Option<&Path>) -> Result<Vec<SinkRule>> {
    if let Some(path) = explicit {
        info!("loading rules from {}", path.display());
        return load_rules_from_file(path);
    }
    let default = Path::new("rules.yaml");
    if default.exists() {
        info!("loading rules from ./rules.yaml");
        return load_rules_from_file(default);
    }
    info!("using the built-in rule catalogue");
    Ok(builtin_rules())
}

/// The built-in high-confidence catalogue.
pub fn builtin_rules() -> Vec<SinkRule> {
    let mut rules = Vec::new();
    let mut add = |vuln_type: &str,
                   desc: &str,
                   severity: Severity,
                   class_name: &str,
                   method_name: &str,
                   skip_safe: bool,
                   is_static: bool| {
        let mut rule = SinkRule {
            name: String::new(),
            vuln_type: vuln_type.to_string(),
            desc: desc.to_string(),
            severity,
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
            skip_safe,
            is_static,
            pattern: None,
        };
        rule.compile().expect("built-in rule patterns are valid");
        rules.push(rule);
    };

    // RCE: only the invocation moments. getRuntime() just fetches the
    // singleton and is not a sink.
    add("RCE", "Arbitrary command execution", Severity::High, "java.lang.Runtime", "exec", true, false);
    add("RCE", "Arbitrary command execution", Severity::High, "java.lang.ProcessBuilder", "start", false, false);
    // new ProcessBuilder("cmd") is dangerous because start() usually follows.
    add("RCE", "Arbitrary command execution", Severity::High, "java.lang.ProcessBuilder", "<init>", true, false);
    add("RCE", "Script engine evaluation", Severity::High, "javax.script.ScriptEngine", "eval", true, false);
    add("RCE", "Groovy shell evaluation", Severity::High, "groovy.lang.GroovyShell", "evaluate", true, false);
    add("RCE", "Groovy script invocation", Severity::High, "org.codehaus.groovy.runtime.InvokerHelper", "runScript", true, true);

    // UNSERIALIZE: constant-looking streams can still carry attacker bytes,
    // so none of these skip on constant arguments.
    add("UNSERIALIZE", "Native deserialization of untrusted data", Severity::High, "java.io.ObjectInputStream", "readObject", false, false);
    add("UNSERIALIZE", "SnakeYAML document load", Severity::High, "org.yaml.snakeyaml.Yaml", "load", false, false);
    add("UNSERIALIZE", "XStream XML deserialization", Severity::High, "com.thoughtworks.xstream.XStream", "fromXML", false, false);
    add("UNSERIALIZE", "Fastjson object parsing", Severity::High, "com.alibaba.fastjson.JSON", "parseObject", false, true);

    // SSRF: connection-opening operations only; building a URL object is a
    // handle, not a request.
    add("SSRF", "Server-side request forgery", Severity::Medium, "java.net.URL", "openConnection", false, false);
    add("SSRF", "Server-side request forgery", Severity::Medium, "java.net.URL", "openStream", false, false);
    add("SSRF", "Server-side request forgery", Severity::Medium, "org.apache.http.client.HttpClient", "execute", true, false);
    add("SSRF", "Server-side request forgery", Severity::Medium, "org.apache.http.impl.client.CloseableHttpClient", "execute", true, false);
    add("SSRF", "Server-side request forgery", Severity::Medium, "okhttp3.OkHttpClient", "newCall", true, false);
    add("SSRF", "Server-side request forgery", Severity::Medium, "org.springframework.web.client.RestTemplate", "exchange", true, false);
    add("SSRF", "Server-side request forgery", Severity::Medium, "org.springframework.web.client.RestTemplate", "getForObject", true, false);

    // SQLI: execution and statement preparation, where concatenation bites.
    add("SQLI", "SQL injection", Severity::High, "java.sql.Statement", "execute", true, false);
    add("SQLI", "SQL injection", Severity::High, "java.sql.Statement", "executeQuery", true, false);
    add("SQLI", "SQL injection", Severity::High, "java.sql.Statement", "executeUpdate", true, false);
    add("SQLI", "SQL injection", Severity::High, "java.sql.Connection", "prepareStatement", true, false);
    add("SQLI", "SQL injection", Severity::High, "org.mybatis.spring.SqlSessionTemplate", "selectOne", true, false);
    add("SQLI", "SQL injection", Severity::High, "org.mybatis.spring.SqlSessionTemplate", "selectList", true, false);
    add("SQLI", "SQL injection", Severity::High, "javax.persistence.EntityManager", "createNativeQuery", true, false);
    add("SQLI", "SQL injection", Severity::High, "com.jfinal.plugin.activerecord.Db", "find", true, true);

    // XSS: write operations on response/JSP writers; fetching the writer
    // itself is not a sink.
    add("XSS", "Cross-site scripting", Severity::Medium, "java.io.PrintWriter", "write", true, false);
    add("XSS", "Cross-site scripting", Severity::Medium, "java.io.PrintWriter", "print", true, false);
    add("XSS", "Cross-site scripting", Severity::Medium, "javax.servlet.jsp.JspWriter", "print", true, false);
    add("XSS", "Cross-site scripting", Severity::Medium, "javax.servlet.jsp.JspWriter", "write", true, false);
    add("XSS", "Reflected template attribute", Severity::Medium, "org.springframework.web.servlet.ModelAndView", "addObject", true, false);
    add("XSS", "Reflected template attribute", Severity::Medium, "org.springframework.web.servlet.ModelMap", "addAttribute", true, false);

    // PATH_TRAVERSAL: concrete IO helpers, not new File(...) which drowns
    // every scan in noise.
    add("PATH_TRAVERSAL", "Path traversal", Severity::Medium, "java.nio.file.Files", "newInputStream", true, true);
    add("PATH_TRAVERSAL", "Path traversal", Severity::Medium, "java.nio.file.Files", "write", true, true);
    add("PATH_TRAVERSAL", "Path traversal", Severity::Medium, "org.apache.commons.io.FileUtils", "openInputStream", true, true);
    add("PATH_TRAVERSAL", "Path traversal", Severity::Medium, "org.springframework.util.FileCopyUtils", "copy", true, true);
    add("PATH_TRAVERSAL", "Path traversal", Severity::Medium, "java.io.FileInputStream", "<init>", true, false);

    // XXE
    add("XXE", "XML external entity injection", Severity::High, "javax.xml.parsers.DocumentBuilder", "parse", true, false);
    add("XXE", "XML external entity injection", Severity::High, "javax.xml.parsers.SAXParser", "parse", true, false);
    add("XXE", "XML external entity injection", Severity::High, "org.dom4j.io.SAXReader", "read", true, false);

    // REDIRECT
    add("REDIRECT", "Open redirect", Severity::Medium, "javax.servlet.http.HttpServletResponse", "sendRedirect", true, false);
    add("REDIRECT", "Open redirect", Severity::Medium, "org.springframework.web.servlet.view.RedirectView", "<init>", true, false);

    rules
}
