use std::fs;

use anyhow::Context;
use calls_query_compiler::{CallsQueryRequest, CompilerConfig, Error, SqlCompiler};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "calls_query.json";

/// 创建SQL编译器实例，优先使用JSON配置，失败时使用默认配置
fn create_compiler_with_config() -> SqlCompiler {
    match CompilerConfig::from_json_file(CONFIG_FILE) {
        Ok(config) => {
            info!(path = CONFIG_FILE, calls_table = %config.calls_table, "loaded compiler config");
            SqlCompiler::from_config(config)
        }
        Err(e) => {
            warn!(error = %e, "using default compiler config");
            SqlCompiler::new()
        }
    }
}

/// Compiles one JSON request and prints the SQL followed by its parameters.
/// The SQL is re-indented when `pretty_sql` is configured.
fn compile_and_print(compiler: &SqlCompiler, input: &str) -> Result<(), Error> {
    let request: CallsQueryRequest = serde_json::from_str(input)?;
    let compiled = compiler.compile(&request)?;

    println!("{}", compiled.sql);
    println!("{}", serde_json::to_string_pretty(&compiled.params)?);
    Ok(())
}

/// One request per line until CTRL-C or CTRL-D.
fn repl(compiler: &SqlCompiler) -> anyhow::Result<()> {
    let mut rl = DefaultEditor::new()?;
    loop {
        let line = match rl.readline("calls> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = rl.add_history_entry(line) {
            warn!(error = %e, "failed to record history");
        }
        if let Err(e) = compile_and_print(compiler, line) {
            eprintln!("✗ {}", e);
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let compiler = create_compiler_with_config();

    match std::env::args().nth(1) {
        Some(path) => {
            let input = fs::read_to_string(&path)
                .with_context(|| format!("无法读取请求文件 {}", path))?;
            compile_and_print(&compiler, &input)
                .with_context(|| format!("failed to compile request {}", path))?;
        }
        None => repl(&compiler)?,
    }
    Ok(())
}
