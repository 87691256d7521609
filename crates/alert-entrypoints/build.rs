fn main() {
    // Generates the `build` module consumed by `shadow!(build)` in metadata.rs
    if let Err(e) = shadow_rs::ShadowBuilder::builder().build() {
        panic!("failed to generate build metadata: {e}");
    }
}
