use std::env;

fn main() {
    println!("cargo:rerun-if-changed=src/usbdevfs.c");

    // The usbdevfs constants are function-like macros over struct sizes, which
    // bindgen cannot evaluate; a compiled shim reads them from the real headers.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("linux") {
        cc::Build::new().file("src/usbdevfs.c").compile("usbdevfs");
    }
}
