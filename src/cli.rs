// ============================================================================
// TileFE CLI — headless tile-storage exerciser via command-line arguments
// ============================================================================
//
// Usage examples:
//   tilefe --input photo.png
//   tilefe -i *.jpg --cache-kb 512 --swap-dir /tmp/tilefe
//   tilefe -i photo.png --output-dir roundtrip/     (re-export after eviction)
//   tilefe --width 2048 --height 2048               (synthetic fill, no inputs)
//
// Each input image is imported into tiled storage, every tile is forced out
// to the swap file, then the image is read back and compared byte-for-byte
// against the original. With no inputs a synthetic checkerboard is rendered
// through the chunk iterator instead. All processing runs synchronously on
// the current thread except the parallel import slicing.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use crate::io::{manager_from_rgba, manager_to_rgba};
use crate::pixel_region::PixelRegion;
use crate::tile_store::{DEFAULT_CACHE_BYTES, TileStore};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// TileFE headless tile-storage exerciser.
///
/// Import images into tiled, swappable storage and verify lossless round
/// trips under cache pressure — no GUI required.
#[derive(Parser, Debug)]
#[command(
    name = "tilefe",
    about = "TileFE headless tiled-storage round-trip verifier",
    long_about = "Import image files into tiled storage, force every tile out to\n\
                  the swap file, read the image back and verify it byte-for-byte.\n\
                  With no inputs, render a synthetic checkerboard through the\n\
                  chunk iterator instead.\n\n\
                  Example:\n  \
                  tilefe --input photo.png --cache-kb 512 --swap-dir /tmp/tilefe\n  \
                  tilefe -i *.jpg --output-dir roundtrip/"
)]
pub struct CliArgs {
    /// Input image file(s). Glob patterns accepted (e.g. "*.png", "shots/*.jpg").
    /// When omitted, a synthetic checkerboard run is performed instead.
    #[arg(short, long, num_args = 1..)]
    pub input: Vec<String>,

    /// Tile cache budget in KiB. Tiles beyond this are evicted to swap.
    #[arg(long, default_value_t = DEFAULT_CACHE_BYTES / 1024, value_name = "KIB")]
    pub cache_kb: usize,

    /// Directory for the swap file. When omitted, the store is memory-only
    /// and dirty tiles cannot be evicted.
    #[arg(long, value_name = "DIR")]
    pub swap_dir: Option<PathBuf>,

    /// Width of the synthetic surface (used only when no inputs are given).
    #[arg(long, default_value_t = 1024, value_name = "PX")]
    pub width: u32,

    /// Height of the synthetic surface (used only when no inputs are given).
    #[arg(long, default_value_t = 1024, value_name = "PX")]
    pub height: u32,

    /// Output directory. Round-tripped images are re-encoded here as PNG
    /// with the original file stem.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Print per-file cache statistics and timing information.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = all files round-tripped losslessly, `1` = one or more failed.
pub fn run(args: CliArgs) -> ExitCode {
    let budget = args.cache_kb.saturating_mul(1024).max(1);

    let mut store = match &args.swap_dir {
        Some(dir) => TileStore::with_swap_dir(budget, dir.clone()),
        None => {
            // No swap directory given: default to the system temp dir so the
            // round-trip exercise can still evict dirty tiles.
            TileStore::with_swap_dir(budget, std::env::temp_dir())
        }
    };

    // No inputs: synthetic checkerboard pass through the chunk iterator
    if args.input.is_empty() {
        return match run_synthetic(&mut store, args.width, args.height, args.verbose) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: synthetic run failed: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    // Resolve glob patterns / literal paths → concrete PathBufs
    let inputs = resolve_inputs(&args.input);
    if inputs.is_empty() {
        eprintln!("error: no input files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    // Create output directory if specified
    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!(
            "error: could not create output directory '{}': {}",
            dir.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    for (idx, input_path) in inputs.iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input_path.display());
        }

        let file_start = Instant::now();

        match run_one(
            &mut store,
            input_path,
            args.output_dir.as_deref(),
            args.verbose,
        ) {
            Ok(()) => {
                if args.verbose || multi {
                    println!(
                        "  → ok ({:.0}ms)",
                        file_start.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                eprintln!("  error: {}", e);
                any_failure = true;
            }
        }
    }

    if args.verbose {
        print_store_stats(&store);
    }

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

// ============================================================================
// Per-file processing pipeline
// ============================================================================

fn run_one(
    store: &mut TileStore,
    input: &Path,
    output_dir: Option<&Path>,
    verbose: bool,
) -> Result<(), String> {
    // -- Step 1: Load and import into tiled storage ----------------------
    let img = image::open(input)
        .map_err(|e| format!("load failed: {}", e))?
        .to_rgba8();
    let (w, h) = img.dimensions();

    let mut mgr = manager_from_rgba(store, &img).map_err(|e| format!("import failed: {}", e))?;

    if verbose {
        println!(
            "  imported {}x{} as {} tiles ({} resident bytes)",
            w,
            h,
            mgr.ntile_rows() * mgr.ntile_cols(),
            store.resident_bytes()
        );
    }

    // -- Step 2: Force everything out to swap ----------------------------
    store
        .flush_all()
        .map_err(|e| format!("flush failed: {}", e))?;

    if verbose {
        println!(
            "  flushed: {} resident bytes, {} tiles swapped",
            store.resident_bytes(),
            store.swapped_tile_count()
        );
    }

    // -- Step 3: Read back and verify ------------------------------------
    let back = manager_to_rgba(store, &mut mgr).map_err(|e| format!("export failed: {}", e))?;

    if back.as_raw() != img.as_raw() {
        mgr.destroy(store);
        return Err("round trip mismatch: pixel data differs after swap".to_string());
    }

    // -- Step 4: Optional re-export --------------------------------------
    if let Some(dir) = output_dir {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "out".to_string());
        let out_path = dir.join(format!("{}.png", stem));
        back.save(&out_path)
            .map_err(|e| format!("save failed: {}", e))?;
        if verbose {
            println!("  wrote {}", out_path.display());
        }
    }

    mgr.destroy(store);
    Ok(())
}

// ============================================================================
// Synthetic run (no inputs)
// ============================================================================

/// Render a checkerboard through the chunk iterator, flush, then verify a
/// sampling of pixels on the way back in.
fn run_synthetic(
    store: &mut TileStore,
    width: u32,
    height: u32,
    verbose: bool,
) -> Result<(), String> {
    use crate::tile_manager::TileManager;

    println!("synthetic run: {}x{} checkerboard", width, height);
    let start = Instant::now();

    let mut mgr = TileManager::new(store, width, height, 4);

    // Fill via the chunk iterator
    {
        let mut region = PixelRegion::new(&mut mgr, 0, 0, width, height, true);
        while let Some(mut chunk) = region
            .next_chunk(store)
            .map_err(|e| format!("chunk iteration failed: {}", e))?
        {
            for row in 0..chunk.height {
                let y = chunk.y + row;
                let chunk_x = chunk.x;
                let line = chunk.row_mut(row);
                for col in 0..(line.len() as u32 / 4) {
                    let x = chunk_x + col;
                    let on = ((x / 8) + (y / 8)) % 2 == 0;
                    let v = if on { 0xff } else { 0x20 };
                    let px = &mut line[(col * 4) as usize..(col * 4 + 4) as usize];
                    px.copy_from_slice(&[v, v, v, 0xff]);
                }
            }
        }
    }

    store
        .flush_all()
        .map_err(|e| format!("flush failed: {}", e))?;

    // Spot-check a handful of pixels after fault-in from swap
    let samples = [
        (0u32, 0u32),
        (width - 1, 0),
        (0, height - 1),
        (width - 1, height - 1),
        (width / 2, height / 2),
    ];
    for (x, y) in samples {
        let px = mgr
            .get_pixel(store, x, y)
            .map_err(|e| format!("read back failed: {}", e))?
            .ok_or_else(|| format!("pixel ({}, {}) out of bounds", x, y))?;
        let on = ((x / 8) + (y / 8)) % 2 == 0;
        let want = if on { 0xff } else { 0x20 };
        if px != [want, want, want, 0xff] {
            mgr.destroy(store);
            return Err(format!("pixel ({}, {}) mismatch after swap round trip", x, y));
        }
    }

    println!(
        "  verified in {:.0}ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
    if verbose {
        print_store_stats(store);
    }

    mgr.destroy(store);
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            // Literal path — use directly
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        // Treat as glob pattern
        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

fn print_store_stats(store: &TileStore) {
    let stats = store.cache_stats();
    println!(
        "cache: {} hits, {} misses, {} evictions, {} swap-outs, {} swap-ins",
        stats.hits, stats.misses, stats.evictions, stats.swap_outs, stats.swap_ins
    );
    println!(
        "resident: {} bytes of {} budget, {} tiles in swap ({} bytes on disk)",
        store.resident_bytes(),
        store.cache_budget(),
        store.swapped_tile_count(),
        store.swap_file_len()
    );
}
