use std::collections::BTreeMap;

use chrono::Utc;

use super::ExecError;
use super::value::{Key, Value};

fn runtime(msg: impl Into<String>) -> ExecError {
    ExecError::Runtime(msg.into())
}

fn arity(module: &str, name: &str, args: &[Value], expected: usize) -> Result<(), ExecError> {
    if args.len() != expected {
        return Err(runtime(format!(
            "TypeError: {module}.{name}() takes {expected} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn as_f64(value: &Value, context: &str) -> Result<f64, ExecError> {
    match value {
        Value::Int(n) => Ok(*n as f64),
        Value::Float(x) => Ok(*x),
        Value::Bool(b) => Ok(f64::from(*b)),
        other => Err(runtime(format!(
            "TypeError: {context} expects a number, got {}",
            other.type_name()
        ))),
    }
}

fn as_str<'a>(value: &'a Value, context: &str) -> Result<&'a str, ExecError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(runtime(format!(
            "TypeError: {context} expects a string, got {}",
            other.type_name()
        ))),
    }
}

/// Constant attributes on modules (`math.pi` and friends).
pub fn module_attr(module: &str, name: &str) -> Option<Value> {
    match (module, name) {
        ("math", "pi") => Some(Value::Float(std::f64::consts::PI)),
        ("math", "e") => Some(Value::Float(std::f64::consts::E)),
        ("math", "tau") => Some(Value::Float(std::f64::consts::TAU)),
        ("math", "inf") => Some(Value::Float(f64::INFINITY)),
        ("math", "nan") => Some(Value::Float(f64::NAN)),
        _ => None,
    }
}

/// Invoke a module function. All allowlisted modules are implemented
/// natively; nothing here touches the filesystem, network, or process
/// environment.
pub fn call_module_fn(module: &str, name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    match module {
        "math" => math_fn(name, args),
        "json" => json_fn(name, args),
        "time" => time_fn(name, args),
        "collections" => collections_fn(name, args),
        "path" => path_fn(name, args),
        "url" => url_fn(name, args),
        "re" => re_fn(name, args),
        _ => Err(runtime(format!("NameError: module '{module}' is not loaded"))),
    }
}

fn unknown(module: &str, name: &str) -> ExecError {
    runtime(format!(
        "AttributeError: module '{module}' has no attribute '{name}'"
    ))
}

fn math_fn(name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    let unary = |args: &[Value], f: fn(f64) -> f64| -> Result<Value, ExecError> {
        arity("math", name, args, 1)?;
        Ok(Value::Float(f(as_f64(&args[0], "math")?)))
    };
    match name {
        "sqrt" => {
            arity("math", name, &args, 1)?;
            let x = as_f64(&args[0], "math.sqrt")?;
            if x < 0.0 {
                return Err(runtime("ValueError: math domain error"));
            }
            Ok(Value::Float(x.sqrt()))
        }
        "floor" => {
            arity("math", name, &args, 1)?;
            Ok(Value::Int(as_f64(&args[0], "math.floor")?.floor() as i64))
        }
        "ceil" => {
            arity("math", name, &args, 1)?;
            Ok(Value::Int(as_f64(&args[0], "math.ceil")?.ceil() as i64))
        }
        "fabs" => unary(&args, f64::abs),
        "exp" => unary(&args, f64::exp),
        "sin" => unary(&args, f64::sin),
        "cos" => unary(&args, f64::cos),
        "tan" => unary(&args, f64::tan),
        "log10" => {
            arity("math", name, &args, 1)?;
            let x = as_f64(&args[0], "math.log10")?;
            if x <= 0.0 {
                return Err(runtime("ValueError: math domain error"));
            }
            Ok(Value::Float(x.log10()))
        }
        "log" => {
            if args.is_empty() || args.len() > 2 {
                return Err(runtime("TypeError: math.log() takes 1 or 2 arguments"));
            }
            let x = as_f64(&args[0], "math.log")?;
            if x <= 0.0 {
                return Err(runtime("ValueError: math domain error"));
            }
            if args.len() == 2 {
                let base = as_f64(&args[1], "math.log")?;
                Ok(Value::Float(x.log(base)))
            } else {
                Ok(Value::Float(x.ln()))
            }
        }
        "pow" => {
            arity("math", name, &args, 2)?;
            let x = as_f64(&args[0], "math.pow")?;
            let y = as_f64(&args[1], "math.pow")?;
            Ok(Value::Float(x.powf(y)))
        }
        "gcd" => {
            arity("math", name, &args, 2)?;
            let (a, b) = match (&args[0], &args[1]) {
                (Value::Int(a), Value::Int(b)) => (a.unsigned_abs(), b.unsigned_abs()),
                _ => return Err(runtime("TypeError: math.gcd() expects integers")),
            };
            Ok(Value::Int(gcd(a, b) as i64))
        }
        "factorial" => {
            arity("math", name, &args, 1)?;
            let n = match &args[0] {
                Value::Int(n) if *n >= 0 => *n,
                _ => return Err(runtime("ValueError: factorial() expects a non-negative int")),
            };
            let mut acc: i64 = 1;
            for i in 2..=n {
                acc = acc
                    .checked_mul(i)
                    .ok_or_else(|| runtime("OverflowError: factorial() result too large"))?;
            }
            Ok(Value::Int(acc))
        }
        _ => Err(unknown("math", name)),
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn json_fn(name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    match name {
        "dumps" => {
            arity("json", name, &args, 1)?;
            let json = args[0]
                .to_json()
                .ok_or_else(|| runtime("TypeError: value is not JSON serializable"))?;
            serde_json::to_string(&json)
                .map(Value::Str)
                .map_err(|e| runtime(format!("ValueError: {e}")))
        }
        "loads" => {
            arity("json", name, &args, 1)?;
            let text = as_str(&args[0], "json.loads")?;
            let json: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| runtime(format!("ValueError: invalid JSON: {e}")))?;
            Ok(Value::from_json(&json))
        }
        _ => Err(unknown("json", name)),
    }
}

fn time_fn(name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    match name {
        "time" => {
            arity("time", name, &args, 0)?;
            Ok(Value::Float(Utc::now().timestamp_micros() as f64 / 1e6))
        }
        "now" => {
            arity("time", name, &args, 0)?;
            Ok(Value::Timestamp(Utc::now()))
        }
        _ => Err(unknown("time", name)),
    }
}

fn collections_fn(name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    match name {
        "counter" => {
            arity("collections", name, &args, 1)?;
            let items: Vec<Value> = match &args[0] {
                Value::List(items) => items.clone(),
                Value::Str(s) => s.chars().map(|c| Value::Str(c.to_string())).collect(),
                other => {
                    return Err(runtime(format!(
                        "TypeError: counter() expects a list or string, got {}",
                        other.type_name()
                    )));
                }
            };
            let mut counts: BTreeMap<Key, Value> = BTreeMap::new();
            for item in items {
                let key = Key::from_value(&item).ok_or_else(|| {
                    runtime("TypeError: counter() elements must be strings or integers")
                })?;
                let entry = counts.entry(key).or_insert(Value::Int(0));
                if let Value::Int(n) = entry {
                    *n += 1;
                }
            }
            Ok(Value::Dict(counts))
        }
        _ => Err(unknown("collections", name)),
    }
}

fn path_fn(name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    match name {
        "join" => {
            if args.is_empty() {
                return Err(runtime("TypeError: path.join() needs at least one part"));
            }
            let mut out = String::new();
            for arg in &args {
                let part = as_str(arg, "path.join")?;
                if part.starts_with('/') {
                    out = part.to_string();
                } else if out.is_empty() || out.ends_with('/') {
                    out.push_str(part);
                } else {
                    out.push('/');
                    out.push_str(part);
                }
            }
            Ok(Value::Str(out))
        }
        "basename" => {
            arity("path", name, &args, 1)?;
            let p = as_str(&args[0], "path.basename")?;
            Ok(Value::Str(
                p.rsplit('/').next().unwrap_or_default().to_string(),
            ))
        }
        "dirname" => {
            arity("path", name, &args, 1)?;
            let p = as_str(&args[0], "path.dirname")?;
            let dir = match p.rfind('/') {
                Some(0) => "/",
                Some(idx) => &p[..idx],
                None => "",
            };
            Ok(Value::Str(dir.to_string()))
        }
        "splitext" => {
            arity("path", name, &args, 1)?;
            let p = as_str(&args[0], "path.splitext")?;
            let base = p.rsplit('/').next().unwrap_or_default();
            let split = match base.rfind('.') {
                Some(idx) if idx > 0 => p.len() - (base.len() - idx),
                _ => p.len(),
            };
            Ok(Value::List(vec![
                Value::Str(p[..split].to_string()),
                Value::Str(p[split..].to_string()),
            ]))
        }
        _ => Err(unknown("path", name)),
    }
}

fn url_fn(name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    match name {
        "parse" => {
            arity("url", name, &args, 1)?;
            let url = as_str(&args[0], "url.parse")?;
            Ok(parse_url(url))
        }
        "quote" => {
            arity("url", name, &args, 1)?;
            let s = as_str(&args[0], "url.quote")?;
            let mut out = String::with_capacity(s.len());
            for byte in s.bytes() {
                match byte {
                    b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                        out.push(byte as char)
                    }
                    other => out.push_str(&format!("%{other:02X}")),
                }
            }
            Ok(Value::Str(out))
        }
        "unquote" => {
            arity("url", name, &args, 1)?;
            let s = as_str(&args[0], "url.unquote")?;
            let bytes = s.as_bytes();
            let mut out = Vec::with_capacity(bytes.len());
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] == b'%' && i + 2 < bytes.len() {
                    let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                    if let Ok(byte) = u8::from_str_radix(hex, 16) {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                }
                out.push(bytes[i]);
                i += 1;
            }
            Ok(Value::Str(String::from_utf8_lossy(&out).into_owned()))
        }
        _ => Err(unknown("url", name)),
    }
}

/// Minimal URL splitter: scheme://host:port/path?query#fragment. Pure
/// string manipulation, good enough for inspection inside the sandbox.
fn parse_url(url: &str) -> Value {
    let mut map: BTreeMap<Key, Value> = BTreeMap::new();
    let mut rest = url;

    let scheme = match rest.find("://") {
        Some(idx) => {
            let s = &rest[..idx];
            rest = &rest[idx + 3..];
            s
        }
        None => "",
    };

    let (rest, fragment) = match rest.find('#') {
        Some(idx) => (&rest[..idx], &rest[idx + 1..]),
        None => (rest, ""),
    };
    let (rest, query) = match rest.find('?') {
        Some(idx) => (&rest[..idx], &rest[idx + 1..]),
        None => (rest, ""),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let (host, port) = match authority.rfind(':') {
        Some(idx) if authority[idx + 1..].chars().all(|c| c.is_ascii_digit()) => {
            (&authority[..idx], authority[idx + 1..].parse().unwrap_or(0))
        }
        _ => (authority, 0),
    };

    map.insert(Key::Str("scheme".into()), Value::Str(scheme.into()));
    map.insert(Key::Str("host".into()), Value::Str(host.into()));
    map.insert(
        Key::Str("port".into()),
        if port > 0 { Value::Int(port) } else { Value::None },
    );
    map.insert(Key::Str("path".into()), Value::Str(path.into()));
    map.insert(Key::Str("query".into()), Value::Str(query.into()));
    map.insert(Key::Str("fragment".into()), Value::Str(fragment.into()));
    Value::Dict(map)
}

fn re_fn(name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    let compile = |pattern: &str| {
        regex::Regex::new(pattern)
            .map_err(|e| runtime(format!("ValueError: invalid regex: {e}")))
    };
    match name {
        "search" => {
            arity("re", name, &args, 2)?;
            let re = compile(as_str(&args[0], "re.search")?)?;
            let text = as_str(&args[1], "re.search")?;
            Ok(match re.find(text) {
                Some(m) => Value::Str(m.as_str().to_string()),
                None => Value::None,
            })
        }
        "match" => {
            arity("re", name, &args, 2)?;
            let re = compile(as_str(&args[0], "re.match")?)?;
            let text = as_str(&args[1], "re.match")?;
            Ok(Value::Bool(
                re.find(text).map(|m| m.start() == 0).unwrap_or(false),
            ))
        }
        "findall" => {
            arity("re", name, &args, 2)?;
            let re = compile(as_str(&args[0], "re.findall")?)?;
            let text = as_str(&args[1], "re.findall")?;
            Ok(Value::List(
                re.find_iter(text)
                    .map(|m| Value::Str(m.as_str().to_string()))
                    .collect(),
            ))
        }
        "sub" => {
            arity("re", name, &args, 3)?;
            let re = compile(as_str(&args[0], "re.sub")?)?;
            let repl = as_str(&args[1], "re.sub")?;
            let text = as_str(&args[2], "re.sub")?;
            Ok(Value::Str(re.replace_all(text, repl).into_owned()))
        }
        "split" => {
            arity("re", name, &args, 2)?;
            let re = compile(as_str(&args[0], "re.split")?)?;
            let text = as_str(&args[1], "re.split")?;
            Ok(Value::List(
                re.split(text)
                    .map(|s| Value::Str(s.to_string()))
                    .collect(),
            ))
        }
        _ => Err(unknown("re", name)),
    }
}
