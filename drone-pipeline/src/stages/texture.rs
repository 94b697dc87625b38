/// Mesh texturing with mvs-texturing
use super::opensfm::band_nvm_path;
use super::{Stage, StageContext, StageId};
use crate::constants::MAX_TEXTURE_SIZE;
use crate::error::Result;
use crate::multispectral;
use crate::photo::find_largest_photo_dim;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

/// Photos wider than this get a larger texture atlas.
const LARGE_IMAGE_DIM: u32 = 8000;

/// One texturing job: scene, output directory and band subdirectory.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureTarget {
    pub nvm: PathBuf,
    /// Empty for the primary band.
    pub subdir: String,
}

/// Primary band textures into the model directory, other bands into a
/// lowercase subdirectory each.
pub fn texture_targets(ctx: &StageContext) -> Result<Vec<TextureTarget>> {
    let nvm = &ctx.tree.opensfm_reconstruction_nvm;
    if !ctx.reconstruction.is_multi() {
        return Ok(vec![TextureTarget {
            nvm: nvm.clone(),
            subdir: String::new(),
        }]);
    }

    let bands = ctx.reconstruction.bands();
    let primary = multispectral::get_primary_band_name(&bands, &ctx.config.primary_band)?;
    Ok(bands
        .iter()
        .map(|band| {
            if band.name == primary {
                TextureTarget {
                    nvm: nvm.clone(),
                    subdir: String::new(),
                }
            } else {
                TextureTarget {
                    nvm: band_nvm_path(nvm, &band.name),
                    subdir: band.name.to_lowercase(),
                }
            }
        })
        .collect())
}

pub fn max_texture_size(largest_dim: Option<u32>) -> u32 {
    match largest_dim {
        Some(dim) if dim > LARGE_IMAGE_DIM => {
            info!("Large input images ({dim} pixels), increasing maximum texture size");
            MAX_TEXTURE_SIZE * 3
        }
        _ => MAX_TEXTURE_SIZE,
    }
}

pub struct TextureStage;

impl TextureStage {
    fn texture_model(
        ctx: &StageContext,
        mesh: &Path,
        out_dir: &Path,
        nadir: bool,
        max_texture_size: u32,
    ) -> Result<()> {
        for target in texture_targets(ctx)? {
            let dir = if target.subdir.is_empty() {
                out_dir.to_path_buf()
            } else {
                out_dir.join(&target.subdir)
            };
            fs::create_dir_all(&dir)?;

            let textured = dir.join(&ctx.tree.textured_model_obj);
            if !ctx.needs_run(StageId::Texture, &textured, "textured model") {
                continue;
            }
            ctx.cancel.check()?;
            info!("Writing MVS textured file: '{}'", textured.display());

            let spec = ctx
                .tools
                .command(&ctx.tools.paths.recon_tex)
                .path_arg(&target.nvm)
                .path_arg(mesh)
                .path_arg(&dir.join("textured_model_geo"))
                .args(["-d", "gmi", "-o", "gauss_clamping", "-t", "none"]);
            let spec = if nadir { spec.arg("--nadir_mode") } else { spec };
            let spec = spec
                .arg("--no_intermediate_results")
                .arg(format!("--max_texture_size={max_texture_size}"));
            ctx.tools.run(&spec)?;
        }
        Ok(())
    }
}

impl Stage for TextureStage {
    fn id(&self) -> StageId {
        StageId::Texture
    }

    fn outputs_exist(&self, ctx: &StageContext) -> bool {
        let obj = &ctx.tree.textured_model_obj;
        (ctx.config.skip_3dmodel || ctx.tree.texture_path.join(obj).exists())
            && (ctx.config.use_3dmesh || ctx.tree.texture_path_25d.join(obj).exists())
    }

    fn run(&self, ctx: &mut StageContext) -> Result<()> {
        info!("Texture");
        let size = max_texture_size(find_largest_photo_dim(&ctx.reconstruction.photos));

        if !ctx.config.skip_3dmodel {
            Self::texture_model(ctx, &ctx.tree.mesh_file, &ctx.tree.texture_path, false, size)?;
        }
        if !ctx.config.use_3dmesh {
            Self::texture_model(ctx, &ctx.tree.mesh_file_25d, &ctx.tree.texture_path_25d, true, size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_photos_triple_texture_size() {
        assert_eq!(max_texture_size(None), 8192);
        assert_eq!(max_texture_size(Some(8000)), 8192);
        assert_eq!(max_texture_size(Some(8001)), 8192 * 3);
    }
}
