/// Shared constants for pipeline stages and numeric engines

/// Smallest raster side (pixels) a DEM is allowed to collapse to
pub const DEM_RES_FLOOR: usize = 64;

/// Default per-tile pixel budget side for DEM generation
pub const DEM_MAX_TILE_SIZE: usize = 4096;

/// Scale of the gap-fill working copy relative to the full raster
pub const DEM_GAPFILL_OUTSIZE: &str = "10%";

/// Maximum search distance (pixels) for nodata interpolation
pub const DEM_FILL_MAX_DISTANCE: f64 = 100.0;

/// GDAL block cache share used for raster conversions
pub const GDAL_CACHEMAX: &str = "34.85%";

/// GDAL block cache share used when warping with a cutline
pub const GDAL_CACHEMAX_WARP: &str = "35.4%";

/// Focal ratio used when EXIF data cannot produce one
pub const DEFAULT_FOCAL_RATIO: f64 = 0.85;

/// Band name assigned to photos without spectral metadata
pub const DEFAULT_BAND_NAME: &str = "RGB";

/// Images whose larger side is at or below this are aligned with ECC only
pub const LOW_RES_ALIGNMENT: u32 = 320;

/// Long-side cap applied before building the ECC pyramid
pub const ECC_MAX_SIZE: u32 = 1280;

/// Pyramid levels are added until the short side drops to this
pub const ECC_MIN_PYRAMID_SIDE: u32 = 300;

/// Lowe ratio applied to nearest/second-nearest descriptor distances
pub const FEATURE_RETENTION: f64 = 0.7;

/// Minimum good matches before a feature homography is attempted
pub const MIN_MATCH_COUNT: usize = 10;

/// Multi-camera rigs are recognised between these band counts (inclusive)
pub const MIN_BANDS: usize = 2;
pub const MAX_BANDS: usize = 8;

/// Depth maps never go below this many pixels
pub const MIN_DEPTHMAP_RESOLUTION: u32 = 320;

/// Depth map resolution used when photo dimensions are unknown
pub const DEFAULT_DEPTHMAP_RESOLUTION: u32 = 640;

/// Default texture atlas side for mvs-texturing
pub const MAX_TEXTURE_SIZE: u32 = 8 * 1024;

/// Outward smoothing distance (metres) applied after a negative crop buffer
pub const BUFFER_SMOOTH_DISTANCE: f64 = 3.0;

/// Neighbour count for statistical outlier removal
pub const FILTER_MEAN_K: u32 = 16;

/// OpenSfM undistorted image cap when no explicit config overrides it
pub const UNDISTORTED_IMAGE_MAX_SIZE: u32 = 2048;

/// Run log file name under the output root
pub const RUN_LOG: &str = "run_log.txt";

/// Benchmark log file name under the output root
pub const BENCHMARK_LOG: &str = "benchmark.txt";

/// Banner separating stages in the run log
pub const STAGE_BANNER: &str = "========================================";
