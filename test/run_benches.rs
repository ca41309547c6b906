use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tempfile::Builder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting writer_bench and reader_bench against one queue...");

    let temp_dir = Builder::new().prefix("blockq_bench").tempdir()?;
    let config_file_path: PathBuf = temp_dir.path().join("bench_config.toml");

    let config_content = format!(
        "queue_name = \"bench\"\n\
        item_size = 64\n\
        queue_size = 128\n\
        \n\
        [store]\n\
        data_dir = \"{}\"\n\
        sync_on_write = false\n\
        clear_workers = 4\n",
        temp_dir.path().to_str().ok_or("temp dir is not valid UTF-8")?.replace('\\', "\\\\"),
    );
    let mut file = File::create(&config_file_path)?;
    file.write_all(config_content.as_bytes())?;
    println!("Temporary benchmark config created at: {}", config_file_path.display());

    let cargo_executable = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let bench = |package: &str, extra: &[&str]| {
        Command::new(&cargo_executable)
            .args(["run", "--release", "--package", package, "--", "--config"])
            .arg(&config_file_path)
            .args(extra)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    };

    let writer = bench("writer_bench", &["--count", "20000"])?;
    let reader = bench("reader_bench", &["--idle-exit-ms", "30000"])?;

    let writer_output = writer.wait_with_output()?;
    let reader_output = reader.wait_with_output()?;
    println!("writer_bench stdout:\n{}", String::from_utf8_lossy(&writer_output.stdout));
    println!("reader_bench stdout:\n{}", String::from_utf8_lossy(&reader_output.stdout));

    if !writer_output.status.success() || !reader_output.status.success() {
        eprintln!("writer_bench stderr:\n{}", String::from_utf8_lossy(&writer_output.stderr));
        eprintln!("reader_bench stderr:\n{}", String::from_utf8_lossy(&reader_output.stderr));
        return Err("a bench process failed".into());
    }
    if !String::from_utf8_lossy(&reader_output.stdout).contains("Finished after 20000 messages") {
        return Err("reader_bench did not see the end marker after 20000 messages".into());
    }

    println!("\nBench run finished.");
    Ok(())
}
