//! End-to-end shader building: blueprint templates plus piece assets through
//! the whole pass pipeline.

use std::sync::Arc;

use crucible::{
    AssetId, ShaderBlueprintResource, ShaderBlueprintResourceId, ShaderBuilder,
    ShaderPieceResource, ShaderProperties,
};

fn piece(name: &str, source: &str) -> Arc<ShaderPieceResource> {
    Arc::new(ShaderPieceResource::new(AssetId::from_name(name), source))
}

fn blueprint(name: &str, source: &str, referenced: &[&str]) -> ShaderBlueprintResource {
    ShaderBlueprintResource::new(
        ShaderBlueprintResourceId::from_name(name),
        AssetId::from_name(name),
        source,
        Vec::new(),
        ShaderBlueprintResource::referenced_from_names(referenced),
    )
}

#[test]
fn full_template_build() {
    let lighting = piece(
        "pieces/lighting.piece",
        "@piece(LightLoop)@foreach(NUM_LIGHTS, i)color += light@i(n);\n@end@end",
    );
    let fragment = blueprint(
        "fragment.blueprint",
        "\
layout(location = @counter(loc)) in vec3 normal;
layout(location = @counter(loc)) in vec2 uv;
const uint MAX_BONES = @math(NUM_BONES * 2);
void main() {
@property(USE_LIGHTING)@insertpiece(LightLoop)@else color = vec3(@value(NUM_LIGHTS));
@end}",
        &["USE_LIGHTING", "NUM_LIGHTS", "NUM_BONES"],
    );

    let properties = ShaderProperties::from(
        [("USE_LIGHTING", 1), ("NUM_LIGHTS", 2), ("NUM_BONES", 16)].as_slice(),
    );
    let built = ShaderBuilder::new()
        .build(&fragment, &[Arc::clone(&lighting)], &properties)
        .unwrap();

    assert!(built.source_code.contains("layout(location = 0) in vec3 normal;"));
    assert!(built.source_code.contains("layout(location = 1) in vec2 uv;"));
    assert!(built.source_code.contains("const uint MAX_BONES = 32;"));
    assert!(built.source_code.contains("color += light0(n);"));
    assert!(built.source_code.contains("color += light1(n);"));
    assert!(!built.source_code.contains("light2"));
    assert!(!built.source_code.contains('@'), "unresolved directive in:\n{}", built.source_code);
    assert_eq!(
        built.asset_ids.as_slice(),
        &[lighting.asset_id, fragment.asset_id]
    );
}

#[test]
fn property_variants_produce_different_source() {
    let bp = blueprint(
        "variant.blueprint",
        "@property(USE_NORMAL_MAP)vec3 n = sampleNormalMap(uv);@else vec3 n = normal;@end",
        &["USE_NORMAL_MAP"],
    );

    let with_map = ShaderBuilder::new()
        .build(&bp, &[], &ShaderProperties::from([("USE_NORMAL_MAP", 1)].as_slice()))
        .unwrap();
    let without_map = ShaderBuilder::new()
        .build(&bp, &[], &ShaderProperties::new())
        .unwrap();

    assert!(with_map.source_code.contains("sampleNormalMap"));
    assert!(!without_map.source_code.contains("sampleNormalMap"));
    assert_ne!(with_map.source_code, without_map.source_code);
}

#[test]
fn rebuild_is_bit_identical() {
    let common = piece(
        "pieces/common.piece",
        "@piece(Uniforms)layout(set = 0) uniform Params { vec4 tint; };@end",
    );
    let bp = blueprint(
        "stable.blueprint",
        "@insertpiece(Uniforms)\nbinding @counter(b); binding @counter(b);",
        &[],
    );
    let properties = ShaderProperties::new();

    let first = ShaderBuilder::new()
        .build(&bp, &[Arc::clone(&common)], &properties)
        .unwrap();
    // Reusing one builder must not leak counters or pieces between builds.
    let mut builder = ShaderBuilder::new();
    builder.build(&bp, &[Arc::clone(&common)], &properties).unwrap();
    let second = builder.build(&bp, &[common], &properties).unwrap();

    assert_eq!(first.source_code, second.source_code);
    assert_eq!(first.combined_asset_file_hash, second.combined_asset_file_hash);
    assert!(second.source_code.contains("binding 0; binding 1;"));
}

#[test]
fn set_in_piece_is_visible_to_blueprint() {
    let config = piece("pieces/config.piece", "@set(TILE_SIZE, 8)");
    let bp = blueprint(
        "tiled.blueprint",
        "const uint TILE = @value(TILE_SIZE);",
        &[],
    );
    let built = ShaderBuilder::new()
        .build(&bp, &[config], &ShaderProperties::new())
        .unwrap();
    assert!(built.source_code.contains("const uint TILE = 8;"));
}

#[test]
fn build_errors_do_not_emit_partial_source() {
    let bp = blueprint("broken.blueprint", "@insertpiece(DoesNotExist)", &[]);
    assert!(
        ShaderBuilder::new()
            .build(&bp, &[], &ShaderProperties::new())
            .is_err()
    );
}

#[test]
fn combined_hash_tracks_asset_content() {
    let bp_a = blueprint("hash.blueprint", "void main() { A(); }", &[]);
    let bp_b = blueprint("hash.blueprint", "void main() { B(); }", &[]);
    let a = ShaderBuilder::new().build(&bp_a, &[], &ShaderProperties::new()).unwrap();
    let b = ShaderBuilder::new().build(&bp_b, &[], &ShaderProperties::new()).unwrap();
    assert_ne!(a.combined_asset_file_hash, b.combined_asset_file_hash);
}
