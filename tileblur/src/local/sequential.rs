//! Sequential baseline: one image at a time, no queue.

use super::{LocalError, RunSummary};
use crate::blur::{self, Kernel};
use crate::config::Settings;
use crate::raster;
use std::time::Instant;
use tracing::{info, warn};

/// Blurs every discovered input image in sequence.
///
/// The baseline the parallel modes are measured against: decode, blur the
/// whole image in one pass, save. Decode failures skip that image only.
pub async fn run_sequential(settings: &Settings) -> Result<RunSummary, LocalError> {
    settings.validate()?;
    let kernel = Kernel::gaussian(settings.kernel_size)?;
    let paths = raster::discover_images(&settings.input_dir)?;

    let mut outputs = Vec::new();
    for (image_id, input) in paths.iter().enumerate() {
        let output = raster::output_path_for(input, &settings.output_dir);
        let started = Instant::now();

        let work_input = input.clone();
        let work_output = output.clone();
        let work_kernel = kernel.clone();
        let saved = tokio::task::spawn_blocking(move || {
            let image = raster::load_image(&work_input)?;
            let blurred = blur::blur_image(&image, &work_kernel);
            raster::save_image(&blurred, &work_output)
        })
        .await
        .map_err(|e| LocalError::Internal(e.to_string()))?;

        match saved {
            Ok(()) => {
                info!(
                    image_id,
                    input = %input.display(),
                    output = %output.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "image blurred"
                );
                outputs.push(output);
            }
            Err(e) => {
                warn!(image_id, input = %input.display(), error = %e, "skipping image");
            }
        }
    }

    Ok(RunSummary {
        images_completed: outputs.len(),
        images_discovered: paths.len(),
        outputs,
    })
}
