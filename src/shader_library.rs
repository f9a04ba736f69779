use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{RenderError, Result};

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Every module the engine asks for.
pub const ENGINE_SHADERS: &[&str] = &[
    "cull.comp",
    "path_tracing.rgen",
    "visibility.vert",
    "hybrid_shading.rgen",
    "modern_shading.comp",
    "gbuffer.vert",
    "deferred_shading.comp",
    "software_tracing.comp",
    "voxelize.comp",
    "voxel_tracing.comp",
    "accumulate.comp",
    "compose.comp",
    "compose_denoised.comp",
];

pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let file = File::open(path).map_err(|_| RenderError::ShaderNotFound {
        name: name.clone(),
        path: path.to_path_buf(),
    })?;
    let len = file.metadata()?.len();
    if len == 0 || len % 4 != 0 {
        return Err(RenderError::MalformedShader {
            name,
            reason: format!("size {len} is not a multiple of four"),
        });
    }

    let mut reader = BufReader::new(file);
    let mut code = vec![0; (len / 4) as usize];
    reader.read_u32_into::<LittleEndian>(&mut code)?;
    if code[0] != SPIRV_MAGIC {
        return Err(RenderError::MalformedShader {
            name,
            reason: format!("bad magic number {:#010x}", code[0]),
        });
    }
    Ok(code)
}

/// Resolves logical stage names such as `accumulate.comp` to SPIR-V modules.
pub struct ShaderLibrary {
    root: Option<PathBuf>,
    modules: HashMap<String, Vec<u32>>,
}

impl ShaderLibrary {
    /// Modules are read from `<root>/<name>.spv` on first use.
    pub fn from_directory(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            modules: HashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            root: None,
            modules: HashMap::new(),
        }
    }

    /// Header-only modules for every engine shader. Enough for devices that
    /// never compile shader code.
    pub fn placeholders() -> Self {
        let mut library = Self::in_memory();
        for name in ENGINE_SHADERS {
            library.register(name, vec![SPIRV_MAGIC, 0x0001_0500, 0, 1, 0]);
        }
        library
    }

    pub fn register(&mut self, name: &str, code: Vec<u32>) {
        self.modules.insert(name.to_string(), code);
    }

    pub fn load(&mut self, name: &str) -> Result<&[u32]> {
        if !self.modules.contains_key(name) {
            let Some(root) = &self.root else {
                return Err(RenderError::ShaderNotFound {
                    name: name.to_string(),
                    path: PathBuf::from("<memory>"),
                });
            };
            let code = load_spirv(&root.join(format!("{name}.spv")))?;
            log::debug!("Loaded shader {} ({} words)", name, code.len());
            self.modules.insert(name.to_string(), code);
        }
        Ok(self.modules.get(name).map(Vec::as_slice).unwrap_or_default())
    }

    /// Fails on the first missing module.
    pub fn preload(&mut self, names: &[&str]) -> Result<()> {
        for name in names {
            self.load(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    fn write_module(dir: &Path, name: &str, words: &[u32]) {
        let mut file = File::create(dir.join(format!("{name}.spv"))).unwrap();
        for word in words {
            file.write_u32::<LittleEndian>(*word).unwrap();
        }
        file.flush().unwrap();
    }

    #[test]
    fn loads_module_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "accumulate.comp", &[SPIRV_MAGIC, 0x0001_0500, 0, 4, 0]);

        let mut library = ShaderLibrary::from_directory(dir.path());
        let code = library.load("accumulate.comp").unwrap();
        assert_eq!(code.len(), 5);
        assert_eq!(code[0], SPIRV_MAGIC);
    }

    #[test]
    fn missing_module_is_shader_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut library = ShaderLibrary::from_directory(dir.path());
        let error = library.load("compose.comp").unwrap_err();
        assert!(matches!(
            error,
            RenderError::ShaderNotFound { name, .. } if name == "compose.comp.spv"
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "cull.comp", &[0xdead_beef, 0]);
        let mut library = ShaderLibrary::from_directory(dir.path());
        assert!(matches!(
            library.load("cull.comp"),
            Err(RenderError::MalformedShader { .. })
        ));
    }

    #[test]
    fn placeholders_cover_engine_shaders() {
        let mut library = ShaderLibrary::placeholders();
        assert!(library.preload(ENGINE_SHADERS).is_ok());
        assert!(library.load("unknown.comp").is_err());
    }
}
