use std::env;
use std::path::PathBuf;

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let llama_cpp_dir = env::var("LLAMA_CPP_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| manifest_dir.join("../../third_party/llama.cpp"));
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    // ── Determine build mode ──────────────────────────────────────────
    //
    // Mode A, **Prebuilt**: set `LLAMA_PREBUILT_DIR` to a directory that
    //   contains `lib/{libllama.a, libggml*.a, …}` and `include/`.
    //   This is the usual path for Android, where llama.cpp is compiled by
    //   the NDK toolchain in a separate step.
    //
    // Mode B, **CMake** (default): build llama.cpp from source located
    //   in `LLAMA_CPP_DIR` (default `third_party/llama.cpp`).

    let (lib_dir, include_dir) = if let Ok(prebuilt) = env::var("LLAMA_PREBUILT_DIR") {
        let prebuilt = PathBuf::from(&prebuilt);
        assert!(
            prebuilt.exists(),
            "LLAMA_PREBUILT_DIR={} does not exist",
            prebuilt.display()
        );
        let lib = if prebuilt.join("lib64").exists() {
            prebuilt.join("lib64")
        } else {
            prebuilt.join("lib")
        };
        let inc = prebuilt.join("include");
        println!(
            "cargo:warning=Using prebuilt llama.cpp from {}",
            prebuilt.display()
        );
        (lib, inc)
    } else {
        assert!(
            llama_cpp_dir.join("CMakeLists.txt").exists(),
            "llama.cpp source not found at {}. \
             Set LLAMA_CPP_DIR or LLAMA_PREBUILT_DIR.",
            llama_cpp_dir.display()
        );

        let mut cfg = cmake::Config::new(&llama_cpp_dir);
        cfg.define("BUILD_SHARED_LIBS", "OFF")
            .define("LLAMA_BUILD_SERVER", "OFF")
            .define("LLAMA_BUILD_TESTS", "OFF")
            .define("LLAMA_BUILD_EXAMPLES", "OFF")
            .define("LLAMA_BUILD_TOOLS", "OFF")
            .define("LLAMA_BUILD_COMMON", "OFF")
            .define("LLAMA_CURL", "OFF");

        if env::var("CARGO_FEATURE_VULKAN").is_ok() {
            cfg.define("GGML_VULKAN", "ON");
        }
        if env::var("CARGO_FEATURE_OPENCL").is_ok() {
            cfg.define("GGML_OPENCL", "ON");
        }
        if target_os == "android" {
            // The NDK has no OpenMP runtime worth linking into a JNI library.
            cfg.define("GGML_OPENMP", "OFF").define("GGML_LLAMAFILE", "OFF");
            if target_arch == "aarch64" {
                cfg.define("GGML_CPU_ARM_ARCH", "armv8.2-a+dotprod+fp16");
            }
        }
        if target_os == "macos" {
            cfg.define("GGML_METAL", "ON");
        }

        let dst = cfg.build();

        let lib = if dst.join("lib64").exists() {
            dst.join("lib64")
        } else {
            dst.join("lib")
        };
        let inc = dst.join("include");
        (lib, inc)
    };

    // ── Link libraries ────────────────────────────────────────────────
    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=static=llama");

    for name in &["ggml", "ggml-base", "ggml-cpu"] {
        if lib_dir.join(format!("lib{name}.a")).exists() {
            println!("cargo:rustc-link-lib=static={name}");
        }
    }

    if env::var("CARGO_FEATURE_VULKAN").is_ok() && lib_dir.join("libggml-vulkan.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-vulkan");
        println!("cargo:rustc-link-lib=vulkan");
    }
    if env::var("CARGO_FEATURE_OPENCL").is_ok() && lib_dir.join("libggml-opencl.a").exists() {
        println!("cargo:rustc-link-lib=static=ggml-opencl");
        println!("cargo:rustc-link-lib=OpenCL");
    }

    match target_os.as_str() {
        "android" => {
            println!("cargo:rustc-link-lib=c++_shared");
            println!("cargo:rustc-link-lib=log");
            println!("cargo:rustc-link-lib=dl");
            println!("cargo:rustc-link-lib=m");
        }
        "linux" => {
            println!("cargo:rustc-link-lib=stdc++");
            println!("cargo:rustc-link-lib=m");
            println!("cargo:rustc-link-lib=pthread");
            println!("cargo:rustc-link-lib=gomp");
        }
        "macos" => {
            if lib_dir.join("libggml-metal.a").exists() {
                println!("cargo:rustc-link-lib=static=ggml-metal");
            }
            for fw in &["Accelerate", "Metal", "MetalKit", "Foundation"] {
                println!("cargo:rustc-link-lib=framework={fw}");
            }
            println!("cargo:rustc-link-lib=c++");
        }
        "windows" => {
            println!("cargo:rustc-link-lib=msvcrt");
        }
        _ => {}
    }

    // ── Generate Rust bindings ────────────────────────────────────────
    let mut builder = bindgen::Builder::default()
        .header("wrapper.h")
        .clang_arg(format!("-I{}", include_dir.display()));

    let ggml_include = llama_cpp_dir.join("ggml/include");
    if ggml_include.exists() {
        builder = builder.clang_arg(format!("-I{}", ggml_include.display()));
    }

    let bindings = builder
        .allowlist_function("llama_.*")
        .allowlist_function("ggml_backend_.*")
        .allowlist_function("ggml_log_.*")
        .allowlist_type("llama_.*")
        .allowlist_type("ggml_.*")
        .allowlist_var("LLAMA_.*")
        .allowlist_var("GGML_.*")
        .derive_default(true)
        .size_t_is_usize(true)
        .generate()
        .expect("Failed to generate bindings");

    let out = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out.join("bindings.rs"))
        .expect("Failed to write bindings");

    println!("cargo:rerun-if-changed=wrapper.h");
    println!("cargo:rerun-if-env-changed=LLAMA_PREBUILT_DIR");
    println!("cargo:rerun-if-env-changed=LLAMA_CPP_DIR");
}
