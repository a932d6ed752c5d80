//! Shader Module
//!
//! Locates HLSL sources in the shader directory, compiles them through the
//! device and builds the two pipelines the frame driver binds.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::gpu::{Format, GpuDevice, PipelineId, ShaderBlob, ShaderSource};

pub const COMPUTE_SHADER: &str = "ComputeShader.hlsl";
pub const VERTEX_SHADER: &str = "VertexShader.hlsl";
pub const PIXEL_SHADER: &str = "PixelShader.hlsl";

const ENTRY_POINT: &str = "main";

/// Compiled pipelines for one run.
#[derive(Debug, Clone, Copy)]
pub struct Pipelines {
    /// Voxel raster pass: UAV table at parameter 0, CBV table at parameter 1.
    pub compute: PipelineId,
    /// Textured plane pass.
    pub graphics: PipelineId,
}

/// Directory the HLSL sources are loaded from.
#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    dir: PathBuf,
}

impl ShaderLibrary {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn source(&self, file: &str, target: &str) -> ShaderSource {
        ShaderSource {
            path: self.dir.join(file),
            entry_point: ENTRY_POINT.to_string(),
            target: target.to_string(),
        }
    }

    pub fn compile(&self, device: &mut dyn GpuDevice, file: &str, target: &str) -> Result<ShaderBlob> {
        let source = self.source(file, target);
        info!("Compiling {:?} ({})", source.path, target);
        device.compile_shader(&source)
    }

    /// Compile all three shaders and create both pipelines.
    pub fn load_pipelines(&self, device: &mut dyn GpuDevice, format: Format) -> Result<Pipelines> {
        let compute_shader = self.compile(device, COMPUTE_SHADER, "cs_5_0")?;
        let vertex_shader = self.compile(device, VERTEX_SHADER, "vs_5_0")?;
        let pixel_shader = self.compile(device, PIXEL_SHADER, "ps_5_0")?;

        Ok(Pipelines {
            compute: device.create_compute_pipeline(&compute_shader)?,
            graphics: device.create_graphics_pipeline(&vertex_shader, &pixel_shader, format)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::gpu::null::NullDevice;

    fn write_shaders(dir: &Path, files: &[&str]) {
        for file in files {
            std::fs::write(dir.join(file), "[numthreads(8, 8, 1)] void main() {}").unwrap();
        }
    }

    #[test]
    fn test_load_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path(), &[COMPUTE_SHADER, VERTEX_SHADER, PIXEL_SHADER]);
        let mut dev = NullDevice::new();

        let pipelines = ShaderLibrary::new(dir.path())
            .load_pipelines(&mut dev, Format::Rgba8Unorm)
            .unwrap();
        assert_ne!(pipelines.compute, pipelines.graphics);
    }

    #[test]
    fn test_missing_shader_fails_with_path() {
        let dir = tempfile::tempdir().unwrap();
        write_shaders(dir.path(), &[COMPUTE_SHADER, VERTEX_SHADER]);
        let mut dev = NullDevice::new();

        match ShaderLibrary::new(dir.path()).load_pipelines(&mut dev, Format::Rgba8Unorm) {
            Err(EngineError::ShaderCompileFailed { path, .. }) => {
                assert_eq!(path, dir.path().join(PIXEL_SHADER));
            }
            other => panic!("expected ShaderCompileFailed, got {:?}", other),
        }
    }
}
