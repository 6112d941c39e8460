use clap::{Parser, Subcommand};
use env_logger::{Builder, Env};
use log::warn;
use std::path::PathBuf;
use tiffmend::diagnose::{human_bytes, DiagnosticConfig};
use tiffmend::repair::{diagnose_file, repair_file};
use tiffmend::source::{PlaneSource, SourceImage};
use tiffmend::writer::{Compression, OutputSink, WriteConfig};

#[derive(Parser)]
#[command(name = "tiffmend", about = "Diagnose and repair large multi-channel OME-TIFF containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show container structure without reading pixel data
    Inspect {
        input: PathBuf,
    },
    /// Classify every declared channel as valid/empty/missing/corrupt
    Diagnose {
        input: PathBuf,
        /// Minimum non-zero percentage for a channel to count as valid
        #[arg(short, long, default_value = "1.0")]
        threshold: f32,
        /// Sample every n-th row and column (default: derived from resolution)
        #[arg(short, long)]
        stride: Option<u32>,
        /// Maximum number of channels to diagnose
        #[arg(short, long)]
        max_channels: Option<u32>,
        /// Also write the report as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Write a repaired container holding only the valid channels
    Extract {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, default_value = "1.0")]
        threshold: f32,
        #[arg(short, long)]
        stride: Option<u32>,
        /// Compression: lzw (default), deflate, jpeg, none
        #[arg(short, long, default_value = "lzw")]
        compression: String,
        /// Output tile size as WIDTHxLENGTH
        #[arg(long, default_value = "512x512")]
        tile: String,
        /// Additionally write one single-channel container per kept channel
        #[arg(short, long)]
        per_channel: bool,
        /// Directory for per-channel containers (default: output's directory)
        #[arg(long)]
        channel_dir: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    match Cli::parse().command {

        // ── Inspect ──────────────────────────────────────────────────────────
        Commands::Inspect { input } => {
            let image = SourceImage::open(&input)?;
            let sidecar = tiffmend::parse_sidecar(image.sidecar_xml(), image.page_count());

            println!("── Container ────────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Variant        {}", if image.is_big_tiff() { "BigTIFF (64-bit offsets)" } else { "classic TIFF" });
            println!("  Pages          {}", image.page_count());
            println!("  Sidecar        {}", if image.sidecar_xml().is_some() { "OME-XML present" } else { "none" });
            println!("  Declared       {} channel(s)", sidecar.declared_count());
            for w in &sidecar.warnings {
                println!("  Warning        {w}");
            }

            println!("\n{:<6} {:>12} {:>8} {:<9} {:<12} {:>14}", "Page", "Shape", "Type", "Codec", "Layout", "Offset");
            for i in 0..image.page_count() {
                if let Some(p) = image.page_info(i) {
                    let layout = match p.tiling {
                        Some((tw, th)) => format!("tiled {tw}x{th}"),
                        None => "striped".into(),
                    };
                    println!(
                        "{:<6} {:>12} {:>8} {:<9} {:<12} {:>14}",
                        p.index,
                        format!("{}x{}", p.shape.1, p.shape.0),
                        p.pixel_type.ome_name(),
                        p.compression.name(),
                        layout,
                        p.byte_offset,
                    );
                }
            }

            if let Some(p) = image.page_info(0) {
                let full = u64::from(p.shape.0)
                    * u64::from(p.shape.1)
                    * p.pixel_type.byte_width() as u64
                    * u64::from(image.page_count());
                println!("\nEstimated memory for a full-resolution load: {}", human_bytes(full));
            }
        }

        // ── Diagnose ─────────────────────────────────────────────────────────
        Commands::Diagnose { input, threshold, stride, max_channels, json } => {
            let config = DiagnosticConfig {
                non_zero_threshold_pct: threshold,
                sample_stride: stride,
                max_channels,
            };
            let diagnosed = diagnose_file(&input, &config)?;
            let report = &diagnosed.report;

            println!("Diagnosing: {}\n", input.display());
            print!("{}", report.render_table());
            println!("\n{}", report.summary());
            for w in &report.warnings {
                println!("warning: {w}");
            }

            if let Some(path) = json {
                std::fs::write(&path, serde_json::to_vec_pretty(report)?)?;
                println!("Report written to {}", path.display());
            }
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract {
            input,
            output,
            threshold,
            stride,
            compression,
            tile,
            per_channel,
            channel_dir,
        } => {
            let diag_config = DiagnosticConfig {
                non_zero_threshold_pct: threshold,
                sample_stride: stride,
                max_channels: None,
            };
            let write_config = WriteConfig {
                tile_shape: parse_tile(&tile)?,
                compression: parse_compression(&compression),
                per_channel_files: per_channel,
            };
            let sink = OutputSink { path: output, channel_dir };

            match repair_file(&input, &diag_config, &sink, &write_config) {
                Ok(outcome) => {
                    print!("{}", outcome.report.render_table());
                    println!("\n{}", outcome.report.summary());
                    println!(
                        "Created: {} ({} channel(s), {})",
                        outcome.extraction.path.display(),
                        outcome.extraction.planes_written,
                        if outcome.extraction.big_tiff { "BigTIFF" } else { "classic TIFF" },
                    );
                    for p in &outcome.extraction.per_channel_paths {
                        println!("  channel  {}", p.display());
                    }
                }
                Err(e) => {
                    // Diagnosis is independently useful; show it even when
                    // the repair itself failed.
                    if let Some(report) = e.report() {
                        print!("{}", report.render_table());
                        println!("\n{}", report.summary());
                    }
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn parse_compression(s: &str) -> Compression {
    Compression::from_name(s).unwrap_or_else(|| {
        warn!("unknown compression '{s}', defaulting to lzw");
        Compression::Lzw
    })
}

fn parse_tile(s: &str) -> Result<(u32, u32), Box<dyn std::error::Error>> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("tile shape must be WIDTHxLENGTH, got '{s}'"))?;
    Ok((w.trim().parse()?, h.trim().parse()?))
}
