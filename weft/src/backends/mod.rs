cfg_if! {
    if #[cfg(all(target_arch = "wasm32"))] {
        compile_error!("weft currently ships only the native shared-memory backend");
    } else {
        mod native;
        pub use native::{AsyncWaitBegin, SharedBuffer, WaitStatus};
    }
}
