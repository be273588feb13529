use std::env;
use std::path::PathBuf;

#[allow(dead_code)]
/// Check for common TokuSpec installation paths.
fn find_tokuspec_sdk() -> Option<PathBuf> {
    let candidates = [
        "C:\\Program Files\\Hamamatsu\\TokuSpec",
        "C:\\Program Files (x86)\\Hamamatsu\\TokuSpec",
    ];

    for path in &candidates {
        let p = PathBuf::from(path);
        if p.join("specu1b.h").exists() {
            return Some(p);
        }
    }
    None
}

fn main() {
    // Only run bindgen and linking logic if the `tokuspec-sdk` feature is
    // enabled. This allows the crate to compile without the SDK installed.
    #[cfg(feature = "tokuspec-sdk")]
    {
        println!("cargo:rerun-if-env-changed=TOKUSPEC_SDK_DIR");
        println!("cargo:rerun-if-changed=wrapper.h");

        let sdk_dir = match env::var("TOKUSPEC_SDK_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                if let Some(found) = find_tokuspec_sdk() {
                    println!(
                        "cargo:warning=TOKUSPEC_SDK_DIR not set, auto-detected: {}",
                        found.display()
                    );
                    found
                } else {
                    panic!(
                        "TOKUSPEC_SDK_DIR environment variable must be set when the \
                         `tokuspec-sdk` feature is enabled (the TokuSpec install \
                         directory containing specu1b.h)."
                    );
                }
            }
        };

        if !sdk_dir.join("specu1b.h").exists() {
            panic!(
                "specu1b.h not found under {:?}; check TOKUSPEC_SDK_DIR",
                sdk_dir
            );
        }

        let bindings = bindgen::Builder::default()
            .header("wrapper.h")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .clang_arg(format!("-I{}", sdk_dir.display()))
            // The driver exports its whole API as USB_* entry points.
            .allowlist_function("USB_.*")
            // Parameter/information blocks exchanged with the device.
            .allowlist_type("UNIT_PARAMETER")
            .allowlist_type("UNIT_INFORMATION")
            .allowlist_var("SPECU1B_.*")
            .derive_default(true)
            .default_enum_style(bindgen::EnumVariation::Rust {
                non_exhaustive: false,
            })
            .generate()
            .expect("Unable to generate specu1b bindings");

        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        bindings
            .write_to_file(out_path.join("bindings.rs"))
            .expect("Couldn't write bindings!");

        println!("cargo:rustc-link-search=native={}", sdk_dir.display());
        println!("cargo:rustc-link-lib=specu1b");
    }
    #[cfg(not(feature = "tokuspec-sdk"))]
    {
        // Without the SDK, write dummy bindings so src/lib.rs still compiles.
        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        std::fs::write(
            out_path.join("bindings.rs"),
            "// Dummy bindings when the tokuspec-sdk feature is not enabled\n",
        )
        .expect("Couldn't write dummy bindings!");
    }
}
