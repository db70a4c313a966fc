use std::fs;
use std::path::PathBuf;
use std::process::Command;

use eyre::{Result, WrapErr, bail, eyre};

const PACKAGE: &str = "kiln-server";
const BINARIES: &[&str] = &["kilnd"];

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let Some(command) = args.get(1) else {
        eprintln!("Usage: cargo xtask <command>");
        eprintln!("\nAvailable commands:");
        eprintln!("  install    Build kilnd in release mode and copy it to ~/.cargo/bin");
        std::process::exit(1);
    };

    match command.as_str() {
        "install" => install(),
        cmd => bail!("unknown command: {cmd}"),
    }
}

fn install() -> Result<()> {
    println!("Building {PACKAGE} in release mode...\n");

    let status = Command::new("cargo")
        .args(["build", "--release", "-p", PACKAGE])
        .status()
        .wrap_err("failed to run cargo")?;
    if !status.success() {
        bail!("cargo build failed with {status}");
    }

    println!("✓ Build completed\n");

    let cargo_bin = dirs::home_dir()
        .ok_or_else(|| eyre!("could not determine home directory"))?
        .join(".cargo")
        .join("bin");
    fs::create_dir_all(&cargo_bin)
        .wrap_err_with(|| format!("failed to create {}", cargo_bin.display()))?;

    let release_dir = PathBuf::from("target/release");

    println!("Installing binaries to {}...\n", cargo_bin.display());

    for binary_name in BINARIES {
        let src = release_dir.join(binary_name);
        if !src.exists() {
            eprintln!("Warning: {binary_name} not found in target/release");
            continue;
        }

        fs::copy(&src, cargo_bin.join(binary_name))
            .wrap_err_with(|| format!("failed to install {binary_name}"))?;
        println!("✓ {binary_name} installed");
    }

    Ok(())
}
