use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Lists all workspace crates so their log targets can be enabled by default.
fn list_crates() -> io::Result<Vec<String>> {
    let mut crates = Vec::new();

    for entry in fs::read_dir("../")? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        if let Some(name) = entry.file_name().to_str()
            && name.starts_with("appstats")
        {
            crates.push(name.replace('-', "_"));
        }
    }

    crates.sort();
    Ok(crates)
}

fn main() -> io::Result<()> {
    let crates = list_crates()?;

    let out_dir = env::var("OUT_DIR").map_err(io::Error::other)?;
    let mut f = File::create(Path::new(&out_dir).join("constants.gen.rs"))?;

    write!(f, "const CRATE_NAMES: &[&str] = &[")?;
    for name in &crates {
        write!(f, "\"{name}\",")?;
    }
    writeln!(f, "];")?;

    println!("cargo:rerun-if-changed=../");
    Ok(())
}
