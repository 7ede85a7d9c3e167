//! MCP NL2SQL Server
//!
//! A Model Context Protocol (MCP) server that answers natural-language and
//! raw SQL requests against a MySQL database. Natural-language requests are
//! translated by a local Ollama model, grounded in the live schema; every
//! statement, whatever its origin, passes a safety guard before execution.
//!
//! # Features
//!
//! - Schema introspection with a TTL-bounded snapshot cache
//! - Natural-language to SQL translation with size-bounded schema prompts
//! - Statement whitelist, stacked-query rejection and automatic row limits
//! - Timeouts, cancellation and a single retry for read-only statements
//! - Opt-in, audited write support

mod config;
mod db;
mod dispatcher;
mod error;
mod executor;
mod guard;
mod lexer;
mod llm;
mod prompt;
mod rpc;
mod schema;
mod server;
#[cfg(test)]
mod testing;

use clap::Parser;
use config::Args;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries protocol frames.
    env_logger::init();

    let args = Args::parse();
    let config = config::load(&args)?;
    server::run(config).await
}
