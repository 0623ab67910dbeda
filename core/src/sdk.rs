//! SDK code generation.
//!
//! Emits sandbox-side source that installs a nested `tools` object over the
//! discovered bindings plus a `$raw` escape hatch. Emission is deterministic
//! for a given (bindings, allowlist) pair: namespaces and methods are sorted
//! and all literals go through JSON escaping.

use std::collections::BTreeMap;

use conduit_protocol::ToolStub;

use crate::policy::TOOL_NAME_DELIMITER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkFlavor {
    /// Async sandbox (subprocess runtime); tool calls go through the
    /// reverse-IPC helper `__internalCallTool`.
    TypeScript,
    /// Snake-case flavor for the embedded scripting backend; helper is
    /// `__internal_call_tool`.
    Python,
    /// In-process isolate; the host bridge `__callTool` returns a JSON
    /// string synchronously.
    Isolate,
}

pub fn emit(flavor: SdkFlavor, bindings: &[ToolStub], allowlist: Option<&[String]>) -> String {
    match flavor {
        SdkFlavor::TypeScript => emit_js(bindings, allowlist, JsCallStyle::Async),
        SdkFlavor::Isolate => emit_js(bindings, allowlist, JsCallStyle::Sync),
        SdkFlavor::Python => emit_python(bindings, allowlist),
    }
}

/// namespace -> sorted (method name, wire name) pairs.
fn grouped(bindings: &[ToolStub]) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut namespaces: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for stub in bindings {
        let Some((namespace, method)) = stub.name.split_once(TOOL_NAME_DELIMITER) else {
            continue;
        };
        if namespace.is_empty() || method.is_empty() {
            continue;
        }
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(method.to_string(), stub.name.clone());
    }
    namespaces
}

fn json_str(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn allowlist_literal(allowlist: Option<&[String]>) -> String {
    match allowlist {
        None => "null".to_string(),
        Some(patterns) => {
            let items: Vec<String> = patterns.iter().map(|p| json_str(p)).collect();
            format!("[{}]", items.join(", "))
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum JsCallStyle {
    Async,
    Sync,
}

fn is_js_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn js_key(name: &str) -> String {
    if is_js_identifier(name) {
        name.to_string()
    } else {
        json_str(name)
    }
}

fn emit_js(bindings: &[ToolStub], allowlist: Option<&[String]>, style: JsCallStyle) -> String {
    let mut out = String::new();
    out.push_str("// conduit tool SDK (generated)\n");
    out.push_str(&format!(
        "const __ALLOWED_TOOLS = {};\n",
        allowlist_literal(allowlist)
    ));
    out.push_str(
        r#"function __isToolAllowed(wireName) {
  if (__ALLOWED_TOOLS === null) return true;
  const segs = wireName.split("__");
  for (const pattern of __ALLOWED_TOOLS) {
    const patSegs = pattern.split(".");
    const wildcard = patSegs.length > 0 && patSegs[patSegs.length - 1] === "*";
    const literal = wildcard ? patSegs.slice(0, -1) : patSegs;
    if (wildcard ? segs.length < literal.length : segs.length !== literal.length) continue;
    let ok = true;
    for (let i = 0; i < literal.length; i++) {
      if (literal[i] !== segs[i]) { ok = false; break; }
    }
    if (ok) return true;
  }
  return false;
}
function __normalizeToolName(name) {
  return name.includes("__") ? name : name.split(".").join("__");
}
"#,
    );
    if style == JsCallStyle::Sync {
        out.push_str(
            r#"function __invokeTool(wireName, args) {
  const parsed = JSON.parse(__callTool(wireName, JSON.stringify(args ?? {})));
  if (parsed.error) {
    const err = new Error(parsed.error.message);
    err.code = parsed.error.code;
    throw err;
  }
  return parsed.result;
}
"#,
        );
    }

    let (prefix, invoke): (&str, fn(&str) -> String) = match style {
        JsCallStyle::Async => ("async ", |wire| {
            format!("await __internalCallTool({wire}, args)")
        }),
        JsCallStyle::Sync => ("", |wire| format!("__invokeTool({wire}, args)")),
    };

    out.push_str("globalThis.tools = {\n");
    out.push_str(&format!(
        "  \"$raw\": {prefix}(name, args = {{}}) => {{\n    const wire = __normalizeToolName(name);\n    if (!__isToolAllowed(wire)) throw new Error(\"Tool '\" + name + \"' is not in the allowlist\");\n    return {};\n  }},\n",
        invoke("wire")
    ));
    for (namespace, methods) in grouped(bindings) {
        out.push_str(&format!("  {}: {{\n", js_key(&namespace)));
        for (method, wire) in methods {
            out.push_str(&format!(
                "    {}: {prefix}(args = {{}}) => {},\n",
                js_key(&method),
                invoke(&json_str(&wire))
            ));
        }
        out.push_str("  },\n");
    }
    out.push_str("};\n");
    out
}

/// camelCase (and PascalCase) to snake_case; already-snake names pass
/// through unchanged.
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_is_lower =
                i > 0 && (chars[i - 1].is_ascii_lowercase() || chars[i - 1].is_ascii_digit());
            let next_is_lower = i + 1 < chars.len() && chars[i + 1].is_ascii_lowercase();
            if i > 0 && (prev_is_lower || (chars[i - 1].is_ascii_uppercase() && next_is_lower)) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(*c);
        }
    }
    out
}

fn emit_python(bindings: &[ToolStub], allowlist: Option<&[String]>) -> String {
    let allowlist_literal = match allowlist {
        None => "None".to_string(),
        Some(patterns) => {
            let items: Vec<String> = patterns.iter().map(|p| json_str(p)).collect();
            format!("[{}]", items.join(", "))
        }
    };

    let mut out = String::new();
    out.push_str("# conduit tool SDK (generated)\n");
    out.push_str(&format!("_ALLOWED_TOOLS = {allowlist_literal}\n"));
    out.push_str(
        r#"def _is_tool_allowed(wire_name):
    if _ALLOWED_TOOLS is None:
        return True
    segs = wire_name.split("__")
    for pattern in _ALLOWED_TOOLS:
        pat_segs = pattern.split(".")
        wildcard = pat_segs and pat_segs[-1] == "*"
        literal = pat_segs[:-1] if wildcard else pat_segs
        if wildcard:
            if len(segs) < len(literal):
                continue
        elif len(segs) != len(literal):
            continue
        if all(a == b for a, b in zip(literal, segs)):
            return True
    return False


def _normalize_tool_name(name):
    return name if "__" in name else name.replace(".", "__")


class _Namespace(dict):
    def __getattr__(self, key):
        try:
            return self[key]
        except KeyError:
            raise AttributeError(key)


def _raw(name, args=None):
    wire = _normalize_tool_name(name)
    if not _is_tool_allowed(wire):
        raise RuntimeError("Tool '" + name + "' is not in the allowlist")
    return __internal_call_tool(wire, args or {})


tools = _Namespace()
tools["$raw"] = _raw
tools["raw"] = _raw
"#,
    );
    for (namespace, methods) in grouped(bindings) {
        let ns_key = json_str(&snake_case(&namespace));
        out.push_str(&format!("tools[{ns_key}] = _Namespace()\n"));
        for (method, wire) in methods {
            out.push_str(&format!(
                "tools[{ns_key}][{}] = lambda args=None, _n={}: __internal_call_tool(_n, args or {{}})\n",
                json_str(&snake_case(&method)),
                json_str(&wire)
            ));
        }
    }
    out
}
