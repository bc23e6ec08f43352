//! Precompiled kernel variants, one per (clipping, normal mode, group size)

use super::kernel::{
    CLIPPING_DEFINE, GROUP_SIZE_DEFINE, INTERPOLATED_NORMALS_DEFINE, TILE_ENTRY_POINT,
    TILE_GENERATION_SHADER,
};
use super::{DispatchConfig, NormalMode, ThreadGroupSize};
use crate::backend::{ComputePipelineDescriptor, ComputePipelineHandle, GraphicsBackend};
use crate::shader::ShaderDefines;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub clipping: bool,
    pub normal_mode: NormalMode,
    pub thread_group_size: ThreadGroupSize,
}

impl VariantKey {
    pub const COUNT: usize = 2 * NormalMode::ALL.len() * ThreadGroupSize::ALL.len();

    /// Every key, in table order
    pub fn all() -> impl Iterator<Item = VariantKey> {
        ThreadGroupSize::ALL.into_iter().flat_map(|thread_group_size| {
            NormalMode::ALL.into_iter().flat_map(move |normal_mode| {
                [false, true].into_iter().map(move |clipping| VariantKey {
                    clipping,
                    normal_mode,
                    thread_group_size,
                })
            })
        })
    }

    pub fn index(&self) -> usize {
        let normals = match self.normal_mode {
            NormalMode::Flat => 0,
            NormalMode::Interpolated => 1,
        };
        (self.thread_group_size.index() << 2) | (normals << 1) | usize::from(self.clipping)
    }

    pub fn defines(&self) -> ShaderDefines {
        let mut defines = ShaderDefines::new().value(GROUP_SIZE_DEFINE, self.thread_group_size.as_u32());
        if self.clipping {
            defines = defines.flag(CLIPPING_DEFINE);
        }
        if self.normal_mode == NormalMode::Interpolated {
            defines = defines.flag(INTERPOLATED_NORMALS_DEFINE);
        }
        defines
    }
}

impl From<&DispatchConfig> for VariantKey {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            clipping: config.clipping,
            normal_mode: config.normal_mode,
            thread_group_size: config.thread_group_size,
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clipping={} normals={} group={}",
            if self.clipping { "on" } else { "off" },
            self.normal_mode,
            self.thread_group_size
        )
    }
}

/// Compute pipelines for every [`VariantKey`].
///
/// A variant that fails to compile is logged and left empty; looking it up
/// returns `None` rather than substituting another variant.
#[derive(Debug, Clone)]
pub struct ShaderVariantTable {
    pipelines: [Option<ComputePipelineHandle>; VariantKey::COUNT],
}

impl ShaderVariantTable {
    pub fn build(backend: &mut dyn GraphicsBackend) -> Self {
        let mut pipelines = [None; VariantKey::COUNT];

        for key in VariantKey::all() {
            let desc = ComputePipelineDescriptor {
                label: Some(format!("Tile Generation [{}]", key)),
                shader: TILE_GENERATION_SHADER.to_string(),
                entry_point: TILE_ENTRY_POINT.to_string(),
                defines: key.defines(),
            };
            match backend.create_compute_pipeline(&desc) {
                Ok(pipeline) => pipelines[key.index()] = Some(pipeline),
                Err(err) => log::error!("Failed to build tile kernel [{}]: {}", key, err),
            }
        }

        let table = Self { pipelines };
        log::info!(
            "Built {}/{} tile kernel variants on {}",
            table.compiled_count(),
            VariantKey::COUNT,
            backend.name()
        );
        table
    }

    pub fn get(&self, key: VariantKey) -> Option<ComputePipelineHandle> {
        self.pipelines[key.index()]
    }

    pub fn compiled_count(&self) -> usize {
        self.pipelines.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.compiled_count() == VariantKey::COUNT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::dispatch::TileStampKernel;
    use std::collections::HashSet;

    #[test]
    fn test_keys_cover_table_once() {
        let indices: HashSet<usize> = VariantKey::all().map(|k| k.index()).collect();
        assert_eq!(VariantKey::COUNT, 16);
        assert_eq!(indices.len(), 16);
        assert!(indices.iter().all(|&i| i < 16));
    }

    #[test]
    fn test_defines_follow_key() {
        let key = VariantKey {
            clipping: true,
            normal_mode: NormalMode::Flat,
            thread_group_size: ThreadGroupSize::X256,
        };
        let defines = key.defines();
        assert!(defines.is_defined(CLIPPING_DEFINE));
        assert!(!defines.is_defined(INTERPOLATED_NORMALS_DEFINE));
        assert_eq!(defines.get(GROUP_SIZE_DEFINE), Some("256"));
    }

    #[test]
    fn test_build_compiles_every_variant() {
        let mut backend = SoftwareBackend::new();
        TileStampKernel::register(&mut backend);
        let table = ShaderVariantTable::build(&mut backend);
        assert!(table.is_complete());

        for key in VariantKey::all() {
            let pipeline = table.get(key).unwrap();
            assert_eq!(backend.pipeline_defines(pipeline), Some(&key.defines()));
        }
    }
}
