// ============================================================================
// Import / export between flat pixel buffers and tile managers
// ============================================================================
//
// The bridge the CLI tool (and any embedding application) uses to move
// whole surfaces across the tile boundary. Import slices the flat buffer
// into per-tile buffers in parallel, then installs them sequentially through
// the normal write path; tiles that are fully transparent are skipped and
// left invalid, so a mostly-empty surface costs almost nothing. Export is a
// serial pass that skips invalid tiles and transparent rows.

use image::RgbaImage;
use rayon::prelude::*;

use crate::error::TileError;
use crate::tile::{RowHint, TILE_HEIGHT, TILE_WIDTH};
use crate::tile_manager::TileManager;
use crate::tile_store::TileStore;

/// Import a flat pixel buffer (`width * height * bpp` bytes, row-major)
/// into a fresh tile manager.
pub fn manager_from_raw(
    store: &mut TileStore,
    width: u32,
    height: u32,
    bpp: u32,
    data: &[u8],
) -> Result<TileManager, TileError> {
    debug_assert_eq!(data.len(), width as usize * height as usize * bpp as usize);
    let mut tm = TileManager::new(store, width, height, bpp);

    let ncols = tm.ntile_cols();
    let src_stride = (width * bpp) as usize;
    let has_alpha = bpp == 2 || bpp == 4;

    // Slice the flat buffer into per-tile buffers in parallel; formats with
    // an alpha channel skip fully-transparent tiles.
    let tile_bufs: Vec<(usize, Option<Vec<u8>>)> = (0..tm.ntiles())
        .into_par_iter()
        .map(|num| {
            let col = num as u32 % ncols;
            let row = num as u32 / ncols;
            let base_x = col * TILE_WIDTH;
            let base_y = row * TILE_HEIGHT;
            let ewidth = TILE_WIDTH.min(width - base_x);
            let eheight = TILE_HEIGHT.min(height - base_y);

            let tile_stride = (ewidth * bpp) as usize;
            let mut buf = vec![0u8; tile_stride * eheight as usize];
            let mut has_content = !has_alpha;

            for ly in 0..eheight as usize {
                let src_start = (base_y as usize + ly) * src_stride + (base_x * bpp) as usize;
                let dst_start = ly * tile_stride;
                buf[dst_start..dst_start + tile_stride]
                    .copy_from_slice(&data[src_start..src_start + tile_stride]);

                if !has_content {
                    let alpha_off = (bpp - 1) as usize;
                    for px in 0..ewidth as usize {
                        if buf[dst_start + px * bpp as usize + alpha_off] != 0 {
                            has_content = true;
                            break;
                        }
                    }
                }
            }

            (num, has_content.then_some(buf))
        })
        .collect();

    for (num, buf) in tile_bufs {
        if let Some(buf) = buf {
            tm.write_tile_data(store, num, &buf)?;
        }
    }
    Ok(tm)
}

/// Import an `RgbaImage` (bpp 4).
pub fn manager_from_rgba(store: &mut TileStore, img: &RgbaImage) -> Result<TileManager, TileError> {
    manager_from_raw(store, img.width(), img.height(), 4, img.as_raw())
}

/// Flatten a manager back to a contiguous buffer. Tiles that were never
/// given content (invalid, no filler) read as zeroes without being
/// materialised; rows hinted fully transparent skip the copy.
pub fn manager_to_raw(store: &mut TileStore, tm: &mut TileManager) -> Result<Vec<u8>, TileError> {
    let (width, height, bpp) = (tm.width(), tm.height(), tm.bpp());
    let dst_stride = (width * bpp) as usize;
    let mut out = vec![0u8; dst_stride * height as usize];

    let ncols = tm.ntile_cols();
    for num in 0..tm.ntiles() {
        if !tm.has_filler() && !tm.is_tile_valid(store, num) {
            continue; // reads as zeroes
        }
        let Some(id) = tm.acquire(store, num, true, false)? else {
            continue;
        };
        let col = num as u32 % ncols;
        let row = num as u32 / ncols;
        let base_x = col * TILE_WIDTH;
        let base_y = row * TILE_HEIGHT;

        let tile = store.arena().get(id);
        let tile_stride = tile.rowstride();
        let row_bytes = (tile.ewidth() * bpp) as usize;
        let data = tile.data().expect("locked tile is resident");

        for ly in 0..tile.eheight() {
            if tile.rowhint(ly) == RowHint::Transparent {
                continue; // destination is already zeroed
            }
            let src_start = ly as usize * tile_stride;
            let dst_start = (base_y + ly) as usize * dst_stride + (base_x * bpp) as usize;
            out[dst_start..dst_start + row_bytes]
                .copy_from_slice(&data[src_start..src_start + row_bytes]);
        }
        store.release(id, false);
    }
    Ok(out)
}

/// Flatten a bpp-4 manager back to an `RgbaImage`.
pub fn manager_to_rgba(store: &mut TileStore, tm: &mut TileManager) -> Result<RgbaImage, TileError> {
    debug_assert_eq!(tm.bpp(), 4, "manager_to_rgba on a non-RGBA surface");
    let (width, height) = (tm.width(), tm.height());
    let raw = manager_to_raw(store, tm)?;
    Ok(RgbaImage::from_raw(width, height, raw).expect("buffer sized to image"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn store() -> TileStore {
        TileStore::with_swap_dir(1 << 22, std::env::temp_dir())
    }

    #[test]
    fn test_raw_round_trip_misaligned_dimensions() {
        let mut store = store();
        let (w, h, bpp) = (150u32, 99u32, 3u32);
        let mut rng = StdRng::seed_from_u64(7);
        let data: Vec<u8> = (0..(w * h * bpp)).map(|_| rng.r#gen()).collect();

        let mut tm = manager_from_raw(&mut store, w, h, bpp, &data).unwrap();
        let back = manager_to_raw(&mut store, &mut tm).unwrap();
        assert_eq!(back, data);
        tm.destroy(&mut store);
    }

    #[test]
    fn test_round_trip_survives_full_eviction() {
        let mut store = store();
        let (w, h) = (200u32, 130u32);
        let mut rng = StdRng::seed_from_u64(99);
        let mut img = RgbaImage::new(w, h);
        for px in img.pixels_mut() {
            px.0 = rng.r#gen();
        }

        let mut tm = manager_from_rgba(&mut store, &img).unwrap();
        store.flush_all().unwrap();
        assert_eq!(store.resident_bytes(), 0);

        let back = manager_to_rgba(&mut store, &mut tm).unwrap();
        assert_eq!(back.as_raw(), img.as_raw());
        tm.destroy(&mut store);
    }

    #[test]
    fn test_transparent_tiles_stay_unmaterialised() {
        let mut store = store();
        let (w, h) = (256u32, 256u32);
        let mut img = RgbaImage::new(w, h); // fully transparent
        // One opaque pixel in the fourth tile row/column.
        img.put_pixel(200, 200, image::Rgba([1, 2, 3, 255]));

        let mut tm = manager_from_rgba(&mut store, &img).unwrap();
        // 4×4 grid; only the touched tile carries content.
        let valid = (0..tm.ntiles())
            .filter(|&n| tm.is_tile_valid(&store, n))
            .count();
        assert_eq!(valid, 1);

        let back = manager_to_rgba(&mut store, &mut tm).unwrap();
        assert_eq!(back.as_raw(), img.as_raw());
        tm.destroy(&mut store);
    }

    #[test]
    fn test_import_respects_tight_budget() {
        // Two tiles' worth of cache for a sixteen-tile image.
        let tile_bytes = (TILE_WIDTH * TILE_HEIGHT * 4) as usize;
        let mut store = TileStore::with_swap_dir(2 * tile_bytes, std::env::temp_dir());
        let (w, h) = (256u32, 256u32);
        let mut rng = StdRng::seed_from_u64(3);
        let mut img = RgbaImage::new(w, h);
        for px in img.pixels_mut() {
            px.0 = rng.r#gen();
        }

        let mut tm = manager_from_rgba(&mut store, &img).unwrap();
        assert!(store.resident_bytes() <= 2 * tile_bytes);
        assert!(store.cache_stats().swap_outs > 0);

        let back = manager_to_rgba(&mut store, &mut tm).unwrap();
        assert_eq!(back.as_raw(), img.as_raw());
        tm.destroy(&mut store);
    }
}
