use std::env;

fn main() {
    let target = env::var("TARGET").unwrap();

    println!("cargo:rustc-check-cfg=cfg(minisched_basepri)");
    println!("cargo:rustc-check-cfg=cfg(minisched_fpu)");

    // BASEPRI exists on v7-M and v8-M mainline; v6-M and v8-M baseline only have PRIMASK
    if target.starts_with("thumbv7m")
        || target.starts_with("thumbv7em")
        || target.starts_with("thumbv8m.main")
    {
        println!("cargo:rustc-cfg=minisched_basepri");
    }

    if target.ends_with("eabihf") {
        println!("cargo:rustc-cfg=minisched_fpu");
    }

    println!("cargo:rerun-if-changed=build.rs");
}
