use gdal::spatial_ref::SpatialRef;
use gdal::vector::Feature;
use gdal::vector::FieldValue;
use gdal::vector::Geometry;
use gdal::vector::Layer;
use gdal::vector::LayerAccess;
use gdal::vector::OGRFieldType;
use gdal::vector::OGRwkbGeometryType;
use gdal::Dataset;
use gdal::DriverManager;
use gdal::spatial_ref::AxisMappingStrategy;
use gdal::vector::LayerOptions;

use crate::clip::aggregate_polygons;
use crate::clip::load_clip_geometry;
use crate::errors::CommandError;
use crate::geometry::flattened;
use crate::layer_source::FeatureSource;
use crate::layer_source::LayerSource;
use crate::split_list::SplitListSource;
use crate::split_list::SplitOutcome;
use crate::target_layer::setup_target_layer;
use crate::transform::GcpTransform;
use crate::transform::GroundControlPoint;
use crate::translate::run_translation;
use crate::translate::TranslateOptions;
use crate::translate::TranslationSession;

fn memory_dataset(name: &str) -> Dataset {
    DriverManager::get_driver_by_name("Memory").expect("the Memory driver should be registered")
        .create_vector_only(name).expect("an in-memory dataset should be creatable")
}

fn add_feature(layer: &Layer, wkt: Option<&str>, values: &[(&str,FieldValue)]) {
    let mut feature = Feature::new(layer.defn()).expect("a blank feature should be creatable");
    for (name,value) in values {
        feature.field_index(name).and_then(|idx| feature.set_field(idx, value)).expect("the field should be settable");
    }
    if let Some(wkt) = wkt {
        feature.set_geometry(Geometry::from_wkt(wkt).expect("the test geometry should parse")).expect("the geometry should be settable");
    }
    feature.create(layer).expect("the feature should be writable");
}

fn roads_source(dataset: &mut Dataset) {
    let layer = dataset.create_layer(LayerOptions {
        name: "roads",
        ty: OGRwkbGeometryType::wkbPoint,
        ..Default::default()
    }).expect("the source layer should be creatable");
    layer.create_defn_fields(&[("name",OGRFieldType::OFTString),("lanes",OGRFieldType::OFTInteger)]).expect("the source fields should be creatable");
    add_feature(&layer, Some("POINT (1 2)"), &[("name",FieldValue::StringValue("first".to_owned())),("lanes",FieldValue::IntegerValue(2))]);
    add_feature(&layer, Some("POINT (3 4)"), &[("name",FieldValue::StringValue("second".to_owned())),("lanes",FieldValue::IntegerValue(4))]);
    add_feature(&layer, Some("POINT (5 6)"), &[("name",FieldValue::StringValue("third".to_owned())),("lanes",FieldValue::IntegerValue(6))]);
}

fn run(options: TranslateOptions, source: &Dataset, destination: &mut Dataset) -> Result<crate::translate::TranslateSummary,CommandError> {
    let mut session = TranslationSession::new(options);
    run_translation(&mut session, source, destination, &mut ())
}

#[test]
fn copy_layer_preserves_fields_and_geometry() {
    let mut source = memory_dataset("source");
    roads_source(&mut source);
    let mut destination = memory_dataset("destination");

    let summary = run(TranslateOptions::default(), &source, &mut destination).expect("the translation should succeed");
    assert_eq!(summary.features_written, 3);
    assert_eq!(summary.features_skipped, 0);

    let mut layer = destination.layer_by_name("roads").expect("the destination layer should exist");
    assert_eq!(layer.defn().fields().count(), 2);
    let features: Vec<_> = layer.features().map(|feature| (
        feature.field(feature.field_index("name").unwrap()).unwrap().unwrap().into_string().unwrap(),
        feature.field(feature.field_index("lanes").unwrap()).unwrap().unwrap().into_int().unwrap(),
        feature.geometry().unwrap().wkt().unwrap()
    )).collect();
    assert_eq!(features, vec![
        ("first".to_owned(),2,"POINT (1 2)".to_owned()),
        ("second".to_owned(),4,"POINT (3 4)".to_owned()),
        ("third".to_owned(),6,"POINT (5 6)".to_owned()),
    ]);
}

#[test]
fn creating_over_existing_layer_requires_append_or_overwrite() {
    let mut source = memory_dataset("source");
    roads_source(&mut source);
    let mut destination = memory_dataset("destination");

    run(TranslateOptions::default(), &source, &mut destination).expect("the first translation should succeed");
    let error = run(TranslateOptions::default(), &source, &mut destination).expect_err("the second translation should fail");
    assert!(matches!(error,CommandError::LayerAlreadyExists(_)));
}

#[test]
fn overwrite_recreates_the_layer() {
    let mut source = memory_dataset("source");
    roads_source(&mut source);
    let mut destination = memory_dataset("destination");

    run(TranslateOptions::default(), &source, &mut destination).expect("the first translation should succeed");
    let summary = run(TranslateOptions {
        overwrite: true,
        ..Default::default()
    }, &source, &mut destination).expect("the overwriting translation should succeed");
    assert_eq!(summary.features_written, 3);

    let layer = destination.layer_by_name("roads").expect("the destination layer should exist");
    assert_eq!(layer.feature_count(), 3);
}

#[test]
fn append_with_add_missing_fields_is_idempotent_on_the_schema() {
    let mut source = memory_dataset("source");
    roads_source(&mut source);
    let mut destination = memory_dataset("destination");

    run(TranslateOptions::default(), &source, &mut destination).expect("the first translation should succeed");
    run(TranslateOptions {
        append: true,
        add_missing_fields: true,
        ..Default::default()
    }, &source, &mut destination).expect("the appending translation should succeed");

    let layer = destination.layer_by_name("roads").expect("the destination layer should exist");
    // same schema, twice the features
    assert_eq!(layer.defn().fields().count(), 2);
    assert_eq!(layer.feature_count(), 6);
}

#[test]
fn colliding_source_names_are_renamed_with_a_numeric_suffix() {
    let mut source = memory_dataset("source");
    let layer = source.create_layer(LayerOptions {
        name: "roads",
        ty: OGRwkbGeometryType::wkbPoint,
        ..Default::default()
    }).expect("the source layer should be creatable");
    // two names that only differ in case collide under the case-insensitive probe
    layer.create_defn_fields(&[("NAME",OGRFieldType::OFTString),("Name",OGRFieldType::OFTString)]).expect("the source fields should be creatable");
    add_feature(&layer, Some("POINT (0 0)"), &[("NAME",FieldValue::StringValue("upper".to_owned()))]);

    let mut destination = memory_dataset("destination");
    run(TranslateOptions::default(), &source, &mut destination).expect("the translation should succeed");

    let layer = destination.layer_by_name("roads").expect("the destination layer should exist");
    let names: Vec<String> = layer.defn().fields().map(|field| field.name()).collect();
    assert_eq!(names, vec!["NAME".to_owned(),"Name2".to_owned()]);
}

#[test]
fn selected_fields_control_the_destination_schema() {
    let mut source = memory_dataset("source");
    roads_source(&mut source);
    let mut destination = memory_dataset("destination");

    run(TranslateOptions {
        selected_fields: Some(vec!["lanes".to_owned()]),
        ..Default::default()
    }, &source, &mut destination).expect("the translation should succeed");

    let mut layer = destination.layer_by_name("roads").expect("the destination layer should exist");
    let names: Vec<String> = layer.defn().fields().map(|field| field.name()).collect();
    assert_eq!(names, vec!["lanes".to_owned()]);
    let lanes: Vec<i32> = layer.features().map(|feature| feature.field(feature.field_index("lanes").unwrap()).unwrap().unwrap().into_int().unwrap()).collect();
    assert_eq!(lanes, vec![2,4,6]);
}

#[test]
fn relaxed_name_matching_maps_case_insensitively_on_append() {
    let mut source = memory_dataset("source");
    let layer = source.create_layer(LayerOptions {
        name: "roads",
        ty: OGRwkbGeometryType::wkbPoint,
        ..Default::default()
    }).expect("the source layer should be creatable");
    layer.create_defn_fields(&[("NAME",OGRFieldType::OFTString)]).expect("the source fields should be creatable");
    add_feature(&layer, Some("POINT (0 0)"), &[("NAME",FieldValue::StringValue("value".to_owned()))]);

    let mut destination = memory_dataset("destination");
    let layer = destination.create_layer(LayerOptions {
        name: "roads",
        ty: OGRwkbGeometryType::wkbPoint,
        ..Default::default()
    }).expect("the destination layer should be creatable");
    layer.create_defn_fields(&[("name",OGRFieldType::OFTString)]).expect("the destination fields should be creatable");

    run(TranslateOptions {
        append: true,
        exact_field_name_match: false,
        ..Default::default()
    }, &source, &mut destination).expect("the translation should succeed");

    let mut layer = destination.layer_by_name("roads").expect("the destination layer should exist");
    let feature = layer.features().next().expect("the appended feature should exist");
    assert_eq!(feature.field(feature.field_index("name").unwrap()).unwrap().unwrap().into_string().unwrap(), "value");
}

#[test]
fn identity_field_map_copies_by_position() {
    let mut source = memory_dataset("source");
    roads_source(&mut source);
    let mut destination = memory_dataset("destination");

    run(TranslateOptions::default(), &source, &mut destination).expect("the first translation should succeed");
    run(TranslateOptions {
        append: true,
        field_map: Some(vec!["identity".to_owned()]),
        ..Default::default()
    }, &source, &mut destination).expect("the appending translation should succeed");

    let layer = destination.layer_by_name("roads").expect("the destination layer should exist");
    assert_eq!(layer.feature_count(), 6);
}

#[test]
fn a_field_map_with_bad_indexes_is_rejected() {
    let mut source = memory_dataset("source");
    roads_source(&mut source);
    let mut destination = memory_dataset("destination");

    run(TranslateOptions::default(), &source, &mut destination).expect("the first translation should succeed");
    let error = run(TranslateOptions {
        append: true,
        field_map: Some(vec!["0".to_owned(),"7".to_owned()]),
        ..Default::default()
    }, &source, &mut destination).expect_err("an out-of-range map should fail");
    assert!(matches!(error,CommandError::InvalidFieldMap(_)));
}

#[test]
fn the_field_map_spans_the_source_schema() {
    let mut source = memory_dataset("source");
    roads_source(&mut source);
    let mut destination = memory_dataset("destination");

    let layer = source.layer_by_name("roads").expect("the source layer should exist");
    let mut layer_source = LayerSource::from_layer(layer);
    let field_count = layer_source.schema().fields.len();
    let context = setup_target_layer(&mut layer_source, &mut destination, &TranslateOptions::default(), "roads", &mut ()).expect("the reconciliation should succeed");

    assert_eq!(context.field_map.len(), field_count);
    for entry in &context.field_map {
        if let Some(index) = entry {
            assert!(*index < context.dst_field_names.len());
        }
    }
}

#[test]
fn exploding_collections_yields_one_feature_per_part() {
    let mut source = memory_dataset("source");
    let layer = source.create_layer(LayerOptions {
        name: "patches",
        ty: OGRwkbGeometryType::wkbMultiPolygon,
        ..Default::default()
    }).expect("the source layer should be creatable");
    layer.create_defn_fields(&[("label",OGRFieldType::OFTString)]).expect("the source fields should be creatable");
    add_feature(&layer,
        Some("MULTIPOLYGON (((0 0,1 0,1 1,0 0)),((2 0,3 0,3 1,2 0)),((4 0,5 0,5 1,4 0)))"),
        &[("label",FieldValue::StringValue("patchwork".to_owned()))]);

    let mut destination = memory_dataset("destination");
    let summary = run(TranslateOptions {
        explode_collections: true,
        ..Default::default()
    }, &source, &mut destination).expect("the translation should succeed");
    assert_eq!(summary.features_written, 3);

    let mut layer = destination.layer_by_name("patches").expect("the destination layer should exist");
    assert_eq!(flattened(layer.defn().geometry_type()), OGRwkbGeometryType::wkbPolygon);
    for feature in layer.features() {
        let geometry = feature.geometry().expect("each part should carry geometry");
        assert_eq!(flattened(geometry.geometry_type()), OGRwkbGeometryType::wkbPolygon);
        assert_eq!(feature.field(feature.field_index("label").unwrap()).unwrap().unwrap().into_string().unwrap(), "patchwork");
    }
}

#[test]
fn promoting_to_multi_wraps_bare_polygons() {
    let mut source = memory_dataset("source");
    let layer = source.create_layer(LayerOptions {
        name: "patches",
        ty: OGRwkbGeometryType::wkbPolygon,
        ..Default::default()
    }).expect("the source layer should be creatable");
    add_feature(&layer, Some("POLYGON ((0 0,1 0,1 1,0 0))"), &[]);

    let mut destination = memory_dataset("destination");
    run(TranslateOptions {
        promote_to_multi: true,
        ..Default::default()
    }, &source, &mut destination).expect("the translation should succeed");

    let mut layer = destination.layer_by_name("patches").expect("the destination layer should exist");
    assert_eq!(flattened(layer.defn().geometry_type()), OGRwkbGeometryType::wkbMultiPolygon);
    let feature = layer.features().next().expect("the feature should exist");
    assert_eq!(flattened(feature.geometry().unwrap().geometry_type()), OGRwkbGeometryType::wkbMultiPolygon);
}

#[test]
fn splitting_list_fields_creates_numbered_scalars() {
    let mut source = memory_dataset("source");
    let layer = source.create_layer(LayerOptions {
        name: "tagged",
        ty: OGRwkbGeometryType::wkbPoint,
        ..Default::default()
    }).expect("the source layer should be creatable");
    layer.create_defn_fields(&[("tags",OGRFieldType::OFTStringList),("label",OGRFieldType::OFTString)]).expect("the source fields should be creatable");
    add_feature(&layer, Some("POINT (0 0)"), &[
        ("tags",FieldValue::StringListValue(vec!["a".to_owned(),"b".to_owned(),"c".to_owned()])),
        ("label",FieldValue::StringValue("full".to_owned()))
    ]);
    add_feature(&layer, Some("POINT (1 1)"), &[
        ("tags",FieldValue::StringListValue(vec!["d".to_owned()])),
        ("label",FieldValue::StringValue("sparse".to_owned()))
    ]);

    let mut destination = memory_dataset("destination");
    run(TranslateOptions {
        split_list_fields: true,
        max_split_list_subfields: Some(5),
        ..Default::default()
    }, &source, &mut destination).expect("the translation should succeed");

    let mut layer = destination.layer_by_name("tagged").expect("the destination layer should exist");
    let names: Vec<String> = layer.defn().fields().map(|field| field.name()).collect();
    // three observed occurrences under a cap of five makes exactly three scalars
    assert_eq!(names, vec!["tags1".to_owned(),"tags2".to_owned(),"tags3".to_owned(),"label".to_owned()]);

    let features: Vec<_> = layer.features().map(|feature| (
        feature.field(feature.field_index("tags1").unwrap()).unwrap().map(|value| value.into_string().unwrap()),
        feature.field(feature.field_index("tags2").unwrap()).unwrap().map(|value| value.into_string().unwrap()),
        feature.field(feature.field_index("tags3").unwrap()).unwrap().map(|value| value.into_string().unwrap()),
    )).collect();
    assert_eq!(features, vec![
        (Some("a".to_owned()),Some("b".to_owned()),Some("c".to_owned())),
        (Some("d".to_owned()),None,None),
    ]);
}

#[test]
fn sources_without_list_fields_are_handed_back() {
    let mut source = memory_dataset("source");
    roads_source(&mut source);
    let layer = source.layer_by_name("roads").expect("the source layer should exist");
    let layer_source = LayerSource::from_layer(layer);
    let outcome = SplitListSource::build(layer_source, None, &mut ()).expect("the build should not fail");
    assert!(matches!(outcome,SplitOutcome::NoListFields(_)));
}

#[test]
fn the_elevation_field_becomes_a_uniform_z() {
    let mut source = memory_dataset("source");
    let layer = source.create_layer(LayerOptions {
        name: "contours",
        ty: OGRwkbGeometryType::wkbLineString,
        ..Default::default()
    }).expect("the source layer should be creatable");
    layer.create_defn_fields(&[("ELEV",OGRFieldType::OFTReal)]).expect("the source fields should be creatable");
    add_feature(&layer, Some("LINESTRING (0 0,1 1,2 0)"), &[("ELEV",FieldValue::RealValue(7.0))]);

    let mut destination = memory_dataset("destination");
    run(TranslateOptions {
        z_field: Some("ELEV".to_owned()),
        ..Default::default()
    }, &source, &mut destination).expect("the translation should succeed");

    let mut layer = destination.layer_by_name("contours").expect("the destination layer should exist");
    let feature = layer.features().next().expect("the feature should exist");
    let geometry = feature.geometry().expect("the geometry should exist");
    for index in 0..3 {
        let (_,_,z) = geometry.get_point(index);
        assert_eq!(z, 7.0);
    }
}

#[test]
fn clipping_keeps_only_what_intersects() {
    let mut source = memory_dataset("source");
    let layer = source.create_layer(LayerOptions {
        name: "patches",
        ty: OGRwkbGeometryType::wkbPolygon,
        ..Default::default()
    }).expect("the source layer should be creatable");
    // one polygon straddling the clip boundary, one entirely outside
    add_feature(&layer, Some("POLYGON ((4 4,6 4,6 6,4 6,4 4))"), &[]);
    add_feature(&layer, Some("POLYGON ((20 20,21 20,21 21,20 20))"), &[]);

    let mut destination = memory_dataset("destination");
    let mut session = TranslationSession::new(TranslateOptions::default());
    session.clip_src = Some(Geometry::from_wkt("POLYGON ((0 0,5 0,5 5,0 5,0 0))").expect("the clip geometry should parse"));
    let summary = run_translation(&mut session, &source, &mut destination, &mut ()).expect("the translation should succeed");

    // the straddling polygon survives as its intersection, the outside one is
    // filtered rather than failed
    assert_eq!(summary.features_written, 1);
    assert_eq!(summary.features_skipped, 0);
    let mut layer = destination.layer_by_name("patches").expect("the destination layer should exist");
    let feature = layer.features().next().expect("the clipped feature should exist");
    let envelope = feature.geometry().unwrap().envelope();
    assert!(envelope.MaxX <= 5.0);
    assert!(envelope.MaxY <= 5.0);
}

#[test]
fn reprojection_moves_coordinates_into_the_target_srs() {
    let mut source = memory_dataset("source");
    let mut wgs84 = SpatialRef::from_epsg(4326).expect("EPSG:4326 should resolve");
    wgs84.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
    let layer = source.create_layer(LayerOptions {
        name: "places",
        ty: OGRwkbGeometryType::wkbPoint,
        srs: Some(&wgs84),
        ..Default::default()
    }).expect("the source layer should be creatable");
    add_feature(&layer, Some("POINT (1 1)"), &[]);

    let mut web_mercator = SpatialRef::from_epsg(3857).expect("EPSG:3857 should resolve");
    web_mercator.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);

    let mut destination = memory_dataset("destination");
    run(TranslateOptions {
        output_srs: Some(web_mercator),
        reproject: true,
        ..Default::default()
    }, &source, &mut destination).expect("the translation should succeed");

    let mut layer = destination.layer_by_name("places").expect("the destination layer should exist");
    let feature = layer.features().next().expect("the feature should exist");
    let (x,y,_) = feature.geometry().unwrap().get_point(0);
    assert!((x - 111319.49079327357).abs() < 0.01);
    assert!((y - 111325.1428663851).abs() < 0.01);
}

#[test]
fn ground_control_points_derive_a_working_transform() {
    let points = [
        GroundControlPoint { pixel: 0.0, line: 0.0, x: 10.0, y: 20.0, z: 0.0 },
        GroundControlPoint { pixel: 1.0, line: 0.0, x: 11.0, y: 20.0, z: 0.0 },
        GroundControlPoint { pixel: 0.0, line: 1.0, x: 10.0, y: 21.0, z: 0.0 },
        GroundControlPoint { pixel: 1.0, line: 1.0, x: 11.0, y: 21.0, z: 0.0 },
    ];
    let transform = GcpTransform::new(&points, 1).expect("the transform should derive from a clean translation");
    let mut geometry = Geometry::from_wkt("POINT (0.5 0.5)").expect("the test geometry should parse");
    assert!(transform.apply(&mut geometry));
    let (x,y,_) = geometry.get_point(0);
    assert!((x - 10.5).abs() < 1e-6);
    assert!((y - 20.5).abs() < 1e-6);
}

#[test]
fn interleaved_reading_translates_every_layer() {
    let mut source = memory_dataset("source");
    roads_source(&mut source);
    let layer = source.create_layer(LayerOptions {
        name: "rivers",
        ty: OGRwkbGeometryType::wkbLineString,
        ..Default::default()
    }).expect("the second source layer should be creatable");
    add_feature(&layer, Some("LINESTRING (0 0,1 1)"), &[]);

    let mut destination = memory_dataset("destination");
    let summary = run(TranslateOptions {
        interleaved: true,
        ..Default::default()
    }, &source, &mut destination).expect("the translation should succeed");
    assert_eq!(summary.features_written, 4);

    assert_eq!(destination.layer_by_name("roads").expect("roads should exist").feature_count(), 3);
    assert_eq!(destination.layer_by_name("rivers").expect("rivers should exist").feature_count(), 1);
}

#[test]
fn clip_loading_rejects_anything_but_polygons() {
    let mut clip_source = memory_dataset("clip");
    let layer = clip_source.create_layer(LayerOptions {
        name: "shapes",
        ty: OGRwkbGeometryType::wkbPoint,
        ..Default::default()
    }).expect("the clip layer should be creatable");
    add_feature(&layer, Some("POINT (0 0)"), &[]);

    let mut layer = clip_source.layer_by_name("shapes").expect("the clip layer should exist");
    let error = aggregate_polygons(&mut layer, None, "source").expect_err("points should not make a clip operand");
    assert!(matches!(error,CommandError::InvalidClipGeometry(_)));
}

#[test]
fn clip_loading_collects_polygons_into_one_operand() {
    let driver = DriverManager::get_driver_by_name("GPKG");
    let driver = match driver {
        Ok(driver) => driver,
        Err(_) => return
    };
    let path = std::env::temp_dir().join("metaphora_clip_test.gpkg");
    let _ = std::fs::remove_file(&path);
    {
        let mut clip_source = driver.create_vector_only(&path).expect("the clip datasource should be creatable");
        let layer = clip_source.create_layer(LayerOptions {
            name: "shapes",
            ty: OGRwkbGeometryType::wkbPolygon,
            ..Default::default()
        }).expect("the clip layer should be creatable");
        add_feature(&layer, Some("POLYGON ((0 0,1 0,1 1,0 0))"), &[]);
        add_feature(&layer, Some("MULTIPOLYGON (((2 0,3 0,3 1,2 0)),((4 0,5 0,5 1,4 0)))"), &[]);
    }

    let loaded = load_clip_geometry(&path, None, Some("shapes"), None, "source")
        .expect("the clip geometry should load")
        .expect("the clip geometry should not be empty");
    assert_eq!(flattened(loaded.geometry_type()), OGRwkbGeometryType::wkbMultiPolygon);
    assert_eq!(loaded.geometry_count(), 3);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn skipped_layers_do_not_stop_a_tolerant_run() {
    let mut source = memory_dataset("source");
    roads_source(&mut source);
    let mut destination = memory_dataset("destination");

    run(TranslateOptions::default(), &source, &mut destination).expect("the first translation should succeed");
    // without --append the second run fails per layer, but tolerantly it just skips
    let summary = run(TranslateOptions {
        skip_failures: true,
        ..Default::default()
    }, &source, &mut destination).expect("the tolerant run should succeed overall");
    assert_eq!(summary.features_written, 0);
}
