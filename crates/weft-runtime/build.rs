//! Build script for weft-runtime
//!
//! Produces the compiled-in configuration defaults:
//! 1. Start with library defaults
//! 2. If WEFT_CONFIG_RS is set, read `pub const NAME: TYPE = VALUE;` lines from it
//! 3. Known names override the defaults, unknown ones are warned about
//! 4. Write OUT_DIR/weft_defaults.rs, included by `config::defaults`

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam { name: "NUM_THREADS", rust_type: "usize", default_value: "4" },
    ConfigParam { name: "AFFINITY", rust_type: "&str", default_value: "\"compact\"" },
    ConfigParam { name: "USED_CORES", rust_type: "usize", default_value: "0" },
    // 0 means "every core after USED_CORES"
    ConfigParam { name: "MAX_CORES", rust_type: "usize", default_value: "0" },
    ConfigParam { name: "USE_PROCESS_MASK", rust_type: "bool", default_value: "false" },
    ConfigParam { name: "STACK_SIZE", rust_type: "usize", default_value: "256 * 1024" },
    ConfigParam { name: "MAX_TASKS", rust_type: "usize", default_value: "65_536" },
    ConfigParam { name: "IDLE_SPINS", rust_type: "u32", default_value: "64" },
    ConfigParam { name: "PARK_TIMEOUT_MS", rust_type: "u64", default_value: "10" },
    ConfigParam { name: "RETRY_ON_ACTIVE_LIMIT", rust_type: "u32", default_value: "64" },
    ConfigParam { name: "SCHEDULER", rust_type: "&str", default_value: "\"local\"" },
    ConfigParam { name: "SCHEDULER_MODE", rust_type: "&str", default_value: "\"default_mode\"" },
    ConfigParam { name: "STACK_POOL_LIMIT", rust_type: "usize", default_value: "1024" },
    ConfigParam { name: "DEBUG", rust_type: "bool", default_value: "false" },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("weft_defaults.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    let user_path = env::var("WEFT_CONFIG_RS").ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                parse_and_merge(&content, &mut config);
                println!("cargo:warning=weft: using custom config {}", path);
            }
            Err(e) => println!("cargo:warning=weft: cannot read WEFT_CONFIG_RS ({}): {}", path, e),
        }
    }
    println!("cargo:rerun-if-env-changed=WEFT_CONFIG_RS");
    println!("cargo:rerun-if-changed=build.rs");

    let output = generate(&config, user_path.is_some());
    fs::write(&dest_path, output).expect("failed to write weft_defaults.rs");
}

fn parse_and_merge(content: &str, config: &mut HashMap<&str, String>) {
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => println!("cargo:warning=weft: unknown config parameter {}", name),
        }
    }
}

/// `pub const NAME: TYPE = VALUE;` -> (NAME, VALUE)
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();
    let (name, rest) = rest.split_once(':')?;
    let (_, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    Some((name.trim().to_string(), value.to_string()))
}

fn generate(config: &HashMap<&str, String>, custom: bool) -> String {
    let mut output = String::from("// Generated by weft-runtime/build.rs\n");
    if custom {
        output.push_str("// Library defaults merged with WEFT_CONFIG_RS\n");
    }
    output.push('\n');
    for param in CONFIG_PARAMS {
        let value = config.get(param.name).map(String::as_str).unwrap_or(param.default_value);
        let ty = if param.rust_type == "&str" { "&'static str" } else { param.rust_type };
        output.push_str(&format!("pub const {}: {} = {};\n", param.name, ty, value));
    }
    output
}
