//! Command-line interface definitions for strip-proxy.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Local forward proxy that intercepts HTTPS CONNECT tunnels.
///
/// strip-proxy answers every CONNECT itself, terminates TLS with a
/// certificate issued on the fly for the requested host, and feeds the
/// decrypted requests back through its own pipeline. Clients must trust the
/// proxy's root certificate (see `strip-proxy ca-cert`).
#[derive(Parser, Debug)]
#[command(name = "strip-proxy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run (or omit to run the proxy).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to listen on.
    ///
    /// Overrides `[listen] addr` from the config files.
    #[arg(short = 'l', long = "listen", value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory holding the root CA (`ca.crt`, `ca.key`).
    ///
    /// Generated on first use. Without it the root CA is ephemeral and
    /// changes on every start.
    #[arg(long = "ca-dir", value_name = "PATH")]
    pub ca_dir: Option<PathBuf>,

    /// Re-inject intercepted streams over loopback instead of in-process.
    #[arg(long = "no-push")]
    pub no_push: bool,

    /// Disable TLS interception.
    ///
    /// No filter claims CONNECT requests, so they are answered with 502.
    #[arg(long = "no-intercept")]
    pub no_intercept: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Subcommands for strip-proxy.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the root CA certificate (PEM) for installation in trust stores.
    ///
    /// Requires a persistent CA (`--ca-dir` or `[ca] dir`).
    #[command(name = "ca-cert")]
    CaCert {
        /// Write the certificate to this file instead of stdout.
        #[arg(short = 'o', long = "out", value_name = "PATH")]
        out: Option<PathBuf>,
    },
}
