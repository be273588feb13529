use std::env;
use std::path::PathBuf;

#[allow(dead_code)]
/// Check for common DCAM-SDK installation paths.
fn find_dcam_sdk() -> Option<PathBuf> {
    let candidates = [
        "C:\\Program Files\\dcamsdk4",
        "/opt/dcamsdk4",
        "/usr/local/hamamatsu_dcam/sdk",
    ];

    for path in &candidates {
        let p = PathBuf::from(path);
        if p.join("inc").exists() {
            return Some(p);
        }
    }
    None
}

fn main() {
    // Only run bindgen and linking logic if the `dcam-sdk` feature is
    // enabled. This allows the crate to compile without the SDK installed.
    #[cfg(feature = "dcam-sdk")]
    {
        println!("cargo:rerun-if-env-changed=DCAM_SDK_DIR");
        println!("cargo:rerun-if-env-changed=DCAM_LIB_DIR");
        println!("cargo:rerun-if-changed=wrapper.h");

        let sdk_dir = match env::var("DCAM_SDK_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                if let Some(found) = find_dcam_sdk() {
                    println!(
                        "cargo:warning=DCAM_SDK_DIR not set, auto-detected: {}",
                        found.display()
                    );
                    found
                } else {
                    panic!(
                        "DCAM_SDK_DIR environment variable must be set when the \
                         `dcam-sdk` feature is enabled."
                    );
                }
            }
        };

        let sdk_include_path = sdk_dir.join("inc");
        if !sdk_include_path.exists() {
            panic!(
                "DCAM SDK include path does not exist: {:?}",
                sdk_include_path
            );
        }

        let sdk_lib_path = match env::var("DCAM_LIB_DIR") {
            Ok(lib_dir) => PathBuf::from(lib_dir),
            Err(_) => sdk_dir.join("lib"),
        };

        let bindings = bindgen::Builder::default()
            .header("wrapper.h")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .clang_arg(format!("-I{}", sdk_include_path.display()))
            // Core API entry points and the wait/property sub-APIs.
            .allowlist_function("dcam.*")
            .allowlist_type("DCAM.*")
            .allowlist_type("HDCAM")
            .allowlist_var("DCAM_.*")
            .allowlist_var("DCAMERR_.*")
            .allowlist_var("DCAMPROP_.*")
            .derive_default(true)
            .default_enum_style(bindgen::EnumVariation::Rust {
                non_exhaustive: false,
            })
            .generate()
            .expect("Unable to generate DCAM bindings");

        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        bindings
            .write_to_file(out_path.join("bindings.rs"))
            .expect("Couldn't write bindings!");

        println!("cargo:rustc-link-search=native={}", sdk_lib_path.display());

        #[cfg(target_os = "windows")]
        {
            println!("cargo:rustc-link-lib=dcamapi");
        }
        #[cfg(not(target_os = "windows"))]
        {
            println!("cargo:rustc-link-lib=dcamapi");
        }
    }
    #[cfg(not(feature = "dcam-sdk"))]
    {
        // Without the SDK, write dummy bindings so src/lib.rs still compiles.
        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        std::fs::write(
            out_path.join("bindings.rs"),
            "// Dummy bindings when the dcam-sdk feature is not enabled\n",
        )
        .expect("Couldn't write dummy bindings!");
    }
}
