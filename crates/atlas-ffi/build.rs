fn main() {
    uniffi::generate_scaffolding("src/atlas.udl").unwrap();
}
