use std::{env, error::Error, fs, path::PathBuf};

// Compiles the built-in shader pair into OUT_DIR; the crate embeds the SPIR-V.
fn main() -> Result<(), Box<dyn Error>> {
    let out = PathBuf::from(env::var("OUT_DIR")?);
    let dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?).join("shaders");

    let comp = shaderc::Compiler::new()?;
    let mut opts = shaderc::CompileOptions::new()?;
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    for (file, kind) in [
        ("mesh.vert", shaderc::ShaderKind::Vertex),
        ("mesh.frag", shaderc::ShaderKind::Fragment),
    ] {
        let path = dir.join(file);
        println!("cargo:rerun-if-changed={}", path.display());
        let src = fs::read_to_string(&path)?;
        let spv = comp.compile_into_spirv(&src, kind, file, "main", Some(&opts))?;
        if spv.get_num_warnings() > 0 {
            println!("cargo:warning={file}: {}", spv.get_warning_messages());
        }
        fs::write(out.join(format!("{file}.spv")), spv.as_binary_u8())?;
    }

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
