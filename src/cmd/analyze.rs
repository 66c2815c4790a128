use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use crossterm::style::Stylize;

use husk::analyzer::{self, AnalysisReport, Analyzer, AnalyzerConfig};
use husk::runtime::CliRuntime;

use crate::progress::Spinner;

pub fn run(image: &str, runtime: Option<&str>, json: Option<&str>, keep: bool) -> Result<()> {
    let config = AnalyzerConfig::default();

    let analysis = if looks_like_archive(image) {
        let spinner = Spinner::new(format!("Analyzing archive {image} ..."));
        let analysis = analyzer::analyze_archive(Path::new(image), &config);
        close_spinner(spinner, image, &analysis.report);
        analysis
    } else {
        let rt = match runtime {
            Some(name) => CliRuntime::from_name(name)?,
            None => CliRuntime::detect()?,
        };
        eprintln!("{} {}", "Runtime".dim(), rt.kind());

        let spinner = Spinner::new(format!("Analyzing {image} ..."));
        let analysis = Analyzer::new(rt, config).analyze(image);
        close_spinner(spinner, image, &analysis.report);
        analysis
    };

    let report = analysis.report.clone();

    if let Some(dest) = json {
        let output = serde_json::to_string_pretty(&report)?;
        if dest == "-" {
            println!("{output}");
        } else {
            fs::write(dest, &output)
                .with_context(|| format!("Failed to write JSON to {dest}"))?;
            eprintln!("{} Wrote {dest}", "✔".green());
        }
    } else {
        print_report(&report);
    }

    if keep
        && let Some(path) = analysis.keep_scratch()
    {
        eprintln!(
            "{} Kept scratch directory (image archive inside): {}",
            "✔".green(),
            path.display()
        );
    }

    if let Some(err) = &report.error {
        anyhow::bail!("Analysis of {image} failed: {err}");
    }
    Ok(())
}

fn close_spinner(spinner: Spinner, image: &str, report: &AnalysisReport) {
    match &report.error {
        None => spinner.finish(format!("Analyzed {image}")),
        Some(err) => spinner.fail(err.clone()),
    }
}

fn print_report(report: &AnalysisReport) {
    println!("{}", report.image.as_str().bold());
    println!("  rootless:    {}", verdict(report.rootless));
    println!("  shell-less:  {}", verdict(report.shellless));
    println!("  distroless:  {}", verdict(report.distroless));

    if let Some(path) = &report.shell_path {
        println!("  shell found at:           /{path}");
    }
    if let Some(path) = &report.package_manager_path {
        println!("  package manager found at: /{path}");
    }
    if let Some(distro) = &report.distribution {
        println!("  distribution:             {distro}");
    }
    println!("  files probed:             {}", report.file_count);
}

fn verdict(value: Option<bool>) -> String {
    match value {
        Some(true) => "yes".green().to_string(),
        Some(false) => "no".yellow().to_string(),
        None => "unknown".dim().to_string(),
    }
}

/// A CLI argument that names a tarball is analyzed directly, no runtime.
pub fn looks_like_archive(image: &str) -> bool {
    let p = Path::new(image);
    matches!(
        p.extension().and_then(|e| e.to_str()),
        Some("tar" | "gz" | "tgz")
    ) || image.ends_with(".tar.gz")
}
