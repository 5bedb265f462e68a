use gdal::spatial_ref::SpatialRef;
use gdal::vector::Feature;
use gdal::vector::Geometry;
use gdal::vector::LayerAccess;
use gdal::vector::OGRwkbGeometryType;
use gdal::vector::sql;
use gdal::Dataset;

use crate::errors::describe_fid;
use crate::errors::CommandError;
use crate::gdal_fixes::FeatureFix;
use crate::gdal_fixes::GeometryFix;
use crate::geometry::flattened;
use crate::geometry::is_3d;
use crate::geometry::is_collection_type;
use crate::geometry::CoordinateDimension;
use crate::geometry::GeometryOperation;
use crate::layer_source::FeatureSource;
use crate::layer_source::LayerSource;
use crate::progress::ProgressObserver;
use crate::split_list::SplitListSource;
use crate::split_list::SplitOutcome;
use crate::target_layer::setup_target_layer;
use crate::target_layer::TargetLayerContext;
use crate::transform::reprojected;
use crate::transform::setup_transforms;
use crate::transform::GcpTransform;

pub(crate) const DEFAULT_GROUP_TRANSACTIONS: u64 = 20000;

// The resolved configuration of one translation run. The command layer builds
// this from its arguments; tests build it directly.
pub(crate) struct TranslateOptions {
    pub(crate) layer_names: Vec<String>,
    pub(crate) sql_statement: Option<String>,
    pub(crate) new_layer_name: Option<String>,
    pub(crate) layer_creation_options: Vec<String>,
    pub(crate) selected_fields: Option<Vec<String>>,
    pub(crate) field_map: Option<Vec<String>>,
    pub(crate) field_types_to_string: Vec<String>,
    pub(crate) unset_field_width: bool,
    pub(crate) append: bool,
    pub(crate) add_missing_fields: bool,
    pub(crate) overwrite: bool,
    pub(crate) exact_field_name_match: bool,
    pub(crate) output_srs: Option<SpatialRef>,
    pub(crate) nullify_output_srs: bool,
    // true when an output SRS was given for reprojection rather than assignment
    pub(crate) reproject: bool,
    pub(crate) source_srs: Option<SpatialRef>,
    pub(crate) forced_geometry_type: Option<OGRwkbGeometryType::Type>,
    pub(crate) promote_to_multi: bool,
    pub(crate) coordinate_dimension: CoordinateDimension,
    pub(crate) geometry_operation: GeometryOperation,
    pub(crate) explode_collections: bool,
    pub(crate) z_field: Option<String>,
    pub(crate) attribute_filter: Option<String>,
    pub(crate) spatial_filter: Option<Geometry>,
    pub(crate) fid: Option<u64>,
    pub(crate) wrap_dateline: bool,
    pub(crate) dateline_offset: String,
    pub(crate) split_list_fields: bool,
    pub(crate) max_split_list_subfields: Option<usize>,
    pub(crate) group_transactions: u64,
    pub(crate) skip_failures: bool,
    pub(crate) interleaved: bool,
    pub(crate) source_file_size: u64,
}

impl Default for TranslateOptions {

    fn default() -> Self {
        Self {
            layer_names: Vec::new(),
            sql_statement: None,
            new_layer_name: None,
            layer_creation_options: Vec::new(),
            selected_fields: None,
            field_map: None,
            field_types_to_string: Vec::new(),
            unset_field_width: false,
            append: false,
            add_missing_fields: false,
            overwrite: false,
            exact_field_name_match: true,
            output_srs: None,
            nullify_output_srs: false,
            reproject: false,
            source_srs: None,
            forced_geometry_type: None,
            promote_to_multi: false,
            coordinate_dimension: CoordinateDimension::Unchanged,
            geometry_operation: GeometryOperation::NoOp,
            explode_collections: false,
            z_field: None,
            attribute_filter: None,
            spatial_filter: None,
            fid: None,
            wrap_dateline: false,
            dateline_offset: "10".to_owned(),
            split_list_fields: false,
            max_split_list_subfields: None,
            group_transactions: DEFAULT_GROUP_TRANSACTIONS,
            skip_failures: false,
            interleaved: false,
            source_file_size: 0,
        }
    }

}

// State shared read-only across all layers of one run, plus the one-time
// warning flags that used to be process-wide statics in older tools.
pub(crate) struct TranslationSession {
    pub(crate) options: TranslateOptions,
    pub(crate) gcp_transform: Option<GcpTransform>,
    pub(crate) clip_src: Option<Geometry>,
    pub(crate) clip_dst: Option<Geometry>,
    pub(crate) wrap_warning_issued: bool,
}

impl TranslationSession {

    pub(crate) fn new(options: TranslateOptions) -> Self {
        Self {
            options,
            gcp_transform: None,
            clip_src: None,
            clip_dst: None,
            wrap_warning_issued: false,
        }
    }

}

#[derive(Clone,Copy,Debug,Default)]
pub(crate) struct LayerSummary {
    pub(crate) features_read: u64,
    pub(crate) features_written: u64,
    pub(crate) features_skipped: u64,
}

#[derive(Clone,Copy,Debug,Default)]
pub(crate) struct TranslateSummary {
    pub(crate) features_written: u64,
    pub(crate) features_skipped: u64,
}

impl TranslateSummary {

    fn absorb(&mut self, layer: &LayerSummary) {
        self.features_written += layer.features_written;
        self.features_skipped += layer.features_skipped;
    }

}

#[derive(Default)]
struct LoopState {
    features_read: u64,
    written: u64,
    skipped: u64,
    done: bool,
    fid_fetched: bool,
}

pub(crate) fn run_translation<Progress: ProgressObserver>(session: &mut TranslationSession, source_dataset: &Dataset, destination: &mut Dataset, progress: &mut Progress) -> Result<TranslateSummary,CommandError> {
    if session.options.sql_statement.is_some() {
        translate_sql(session, source_dataset, destination, progress)
    } else if session.options.interleaved {
        translate_interleaved(session, source_dataset, destination, progress)
    } else {
        translate_sequential(session, source_dataset, destination, progress)
    }
}

fn resolve_layer_name(options: &TranslateOptions, source_name: &str) -> String {
    options.new_layer_name.clone().unwrap_or_else(|| source_name.to_owned())
}

fn selected_layer_names<Progress: ProgressObserver>(session: &TranslationSession, source_dataset: &Dataset, progress: &Progress) -> Result<Vec<String>,CommandError> {
    if session.options.layer_names.is_empty() {
        Ok(source_dataset.layers().map(|layer| layer.name()).collect())
    } else {
        let mut names = Vec::new();
        for name in &session.options.layer_names {
            if source_dataset.layer_by_name(name).is_ok() {
                names.push(name.clone());
            } else if session.options.skip_failures {
                progress.warning(|| format!("Couldn't fetch requested layer '{}'.",name));
            } else {
                return Err(CommandError::LayerNotFound(name.clone()));
            }
        }
        Ok(names)
    }
}

fn apply_source_filters<Progress: ProgressObserver>(session: &TranslationSession, source: &mut dyn FeatureSource, progress: &Progress) -> Result<(),CommandError> {
    if let Some(filter) = &session.options.attribute_filter {
        if let Err(err) = source.set_attribute_filter(filter) {
            if session.options.skip_failures {
                progress.warning(|| format!("Setting the attribute filter '{}' failed: {}",filter,err));
            } else {
                return Err(err);
            }
        }
    }
    if let Some(spatial_filter) = &session.options.spatial_filter {
        source.set_spatial_filter(spatial_filter);
    }
    Ok(())
}

fn translate_sequential<Progress: ProgressObserver>(session: &mut TranslationSession, source_dataset: &Dataset, destination: &mut Dataset, progress: &mut Progress) -> Result<TranslateSummary,CommandError> {

    let layer_names = selected_layer_names(session, source_dataset, progress)?;

    let mut summary = TranslateSummary::default();
    for name in &layer_names {
        let layer = source_dataset.layer_by_name(name)?;
        let mut source = LayerSource::from_layer(layer);
        apply_source_filters(session, &mut source, progress)?;
        let layer_summary = translate_prepared(session, source, source_dataset, destination, progress)?;
        if let Some(layer_summary) = layer_summary {
            summary.absorb(&layer_summary);
        }
    }
    Ok(summary)
}

fn translate_sql<Progress: ProgressObserver>(session: &mut TranslationSession, source_dataset: &Dataset, destination: &mut Dataset, progress: &mut Progress) -> Result<TranslateSummary,CommandError> {

    let statement = match &session.options.sql_statement {
        Some(statement) => statement.clone(),
        None => return Ok(TranslateSummary::default())
    };

    let result = source_dataset.execute_sql(&statement, session.options.spatial_filter.as_ref(), sql::Dialect::DEFAULT)?;
    let result = match result {
        Some(result) => result,
        None => {
            // statements like DDL legitimately have no result set
            progress.warning(|| "The statement produced no result set, nothing to translate.");
            return Ok(TranslateSummary::default());
        }
    };

    let source = LayerSource::from_result_set(result);
    let mut summary = TranslateSummary::default();
    if let Some(layer_summary) = translate_prepared(session, source, source_dataset, destination, progress)? {
        summary.absorb(&layer_summary);
    }
    Ok(summary)
}

// Wraps the list-splitting adapter around a prepared source when requested,
// then reconciles and translates. Returns None when the layer was skipped
// under failure tolerance.
fn translate_prepared<Progress: ProgressObserver>(session: &mut TranslationSession, source: LayerSource, source_dataset: &Dataset, destination: &mut Dataset, progress: &mut Progress) -> Result<Option<LayerSummary>,CommandError> {
    if session.options.split_list_fields {
        match SplitListSource::build(source, session.options.max_split_list_subfields, progress)? {
            SplitOutcome::Split(mut split) => translate_one(session, &mut split, source_dataset, destination, progress),
            SplitOutcome::NoListFields(mut source) => translate_one(session, &mut source, source_dataset, destination, progress)
        }
    } else {
        let mut source = source;
        translate_one(session, &mut source, source_dataset, destination, progress)
    }
}

fn translate_one<Progress: ProgressObserver>(session: &mut TranslationSession, source: &mut dyn FeatureSource, source_dataset: &Dataset, destination: &mut Dataset, progress: &mut Progress) -> Result<Option<LayerSummary>,CommandError> {

    let layer_name = resolve_layer_name(&session.options, &source.schema().name);

    let mut context = match setup_target_layer(source, destination, &session.options, &layer_name, progress) {
        Ok(context) => context,
        Err(err) if session.options.skip_failures => {
            progress.warning(|| format!("Skipping layer '{}': {}",layer_name,err));
            return Ok(None);
        },
        Err(err) => return Err(err)
    };

    source.rewind();

    if session.options.source_file_size > 0 {
        progress.start_known_endpoint(|| (format!("Translating into '{}'.",layer_name),session.options.source_file_size as usize));
    } else if let Some(count) = source.estimated_feature_count() {
        progress.start_known_endpoint(|| (format!("Translating into '{}'.",layer_name),count as usize));
    } else {
        progress.start_unknown_endpoint(|| format!("Translating into '{}'.",layer_name));
    }

    match translate_layer(session, &mut context, source, source_dataset, destination, progress) {
        Ok(layer_summary) => {
            progress.finish(|| format!("{} features written in '{}'.",layer_summary.features_written,layer_name));
            Ok(Some(layer_summary))
        },
        Err(CommandError::Cancelled) => Err(CommandError::Cancelled),
        Err(err) if session.options.skip_failures => {
            progress.warning(|| format!("Terminating translation of layer '{}' prematurely: {}",layer_name,err));
            Ok(None)
        },
        Err(err) => Err(err)
    }
}

fn translate_interleaved<Progress: ProgressObserver>(session: &mut TranslationSession, source_dataset: &Dataset, destination: &mut Dataset, progress: &mut Progress) -> Result<TranslateSummary,CommandError> {

    if session.options.split_list_fields {
        return Err(CommandError::SplitNotSupportedInterleaved);
    }

    let selected = selected_layer_names(session, source_dataset, progress)?;
    let all_names: Vec<String> = source_dataset.layers().map(|layer| layer.name()).collect();

    // first pass: filters and target layers for everything selected
    let mut associated: Vec<(String,Option<TargetLayerContext>)> = Vec::new();
    for name in &all_names {
        if selected.contains(name) {
            let layer = source_dataset.layer_by_name(name)?;
            let mut source = LayerSource::from_layer(layer);
            apply_source_filters(session, &mut source, progress)?;
            let layer_name = resolve_layer_name(&session.options, name);
            match setup_target_layer(&mut source, destination, &session.options, &layer_name, progress) {
                Ok(context) => associated.push((name.clone(),Some(context))),
                Err(err) if session.options.skip_failures => {
                    progress.warning(|| format!("Skipping layer '{}': {}",layer_name,err));
                    associated.push((name.clone(),None));
                },
                Err(err) => return Err(err)
            }
        } else {
            associated.push((name.clone(),None));
        }
    }

    if session.options.source_file_size > 0 {
        progress.start_known_endpoint(|| ("Translating layers interleaved.",session.options.source_file_size as usize));
    } else {
        progress.start_unknown_endpoint(|| "Translating layers interleaved.");
    }

    // second pass: round-robin until a whole round reads nothing anywhere
    let mut summary = TranslateSummary::default();
    loop {
        let mut any_read = false;
        for (name,context) in &mut associated {
            let layer = source_dataset.layer_by_name(name)?;
            let mut source = LayerSource::from_layer(layer);
            if let Some(context) = context {
                match translate_layer(session, context, &mut source, source_dataset, destination, progress) {
                    Ok(layer_summary) => {
                        summary.absorb(&layer_summary);
                        if layer_summary.features_read > 0 {
                            any_read = true;
                        }
                    },
                    Err(CommandError::Cancelled) => return Err(CommandError::Cancelled),
                    Err(err) if session.options.skip_failures => {
                        progress.warning(|| format!("Terminating translation of layer '{}' prematurely: {}",name,err));
                    },
                    Err(err) => return Err(err)
                }
            } else {
                // not translated, but a read-once source still has to be drained
                while let Some(_feature) = source.next_feature()? {
                    any_read = true;
                }
            }
        }
        if !any_read {
            break;
        }
    }
    progress.finish(|| format!("{} features written.",summary.features_written));

    Ok(summary)
}

// The feature translation loop for one layer, or one interleaved slice of it.
// Batches of writes share a transaction on the destination dataset; a fatal
// error rolls the open batch back before surfacing.
pub(crate) fn translate_layer<Progress: ProgressObserver>(
    session: &mut TranslationSession,
    context: &mut TargetLayerContext,
    source: &mut dyn FeatureSource,
    source_dataset: &Dataset,
    destination: &mut Dataset,
    progress: &mut Progress
) -> Result<LayerSummary,CommandError> {

    let TranslationSession { options, gcp_transform, clip_src, clip_dst, wrap_warning_issued } = session;

    // Without an output SRS the translated geometries still get stamped with
    // whatever the relevant source geometry field declares.
    let output_srs = match &options.output_srs {
        Some(srs) => Some(srs.clone()),
        None => if options.nullify_output_srs {
            None
        } else {
            let schema = source.schema();
            if schema.geom_fields.len() == 1 {
                schema.geom_fields[0].srs.clone()
            } else {
                match context.requested_geom_field {
                    Some(requested) if requested > 0 => schema.geom_fields[requested].srs.clone(),
                    _ => None
                }
            }
        }
    };

    // each feature alone in its transaction when failures are tolerated
    let group = if options.skip_failures {
        1
    } else {
        options.group_transactions.max(1)
    };

    let mut state = LoopState::default();
    let mut use_transactions = true;
    while !state.done {
        if use_transactions {
            match destination.start_transaction() {
                Ok(transaction) => {
                    let outcome = process_batch(options, gcp_transform.as_ref(), clip_src.as_ref(), clip_dst.as_ref(), wrap_warning_issued, output_srs.as_ref(), context, source, &transaction, source_dataset, Some(group), &mut state, progress);
                    match outcome {
                        Ok(()) => transaction.commit()?,
                        Err(err) => {
                            // keep the already committed batches, undo this one
                            let _ = transaction.rollback();
                            return Err(err);
                        }
                    }
                },
                Err(_) => {
                    // the destination doesn't do transactions, write directly
                    use_transactions = false;
                    continue;
                }
            }
        } else {
            process_batch(options, gcp_transform.as_ref(), clip_src.as_ref(), clip_dst.as_ref(), wrap_warning_issued, output_srs.as_ref(), context, source, destination, source_dataset, None, &mut state, progress)?;
        }
        if progress.cancelled() {
            return Err(CommandError::Cancelled);
        }
    }

    Ok(LayerSummary {
        features_read: state.features_read,
        features_written: state.written,
        features_skipped: state.skipped,
    })
}

fn poll_bytes_read(source_dataset: &Dataset) -> Option<u64> {
    let mut result = source_dataset.execute_sql("GetBytesRead()", None, sql::Dialect::DEFAULT).ok().flatten()?;
    let feature = result.features().next()?;
    let text = feature.field_as_string(0).ok().flatten()?;
    text.parse().ok()
}

#[allow(clippy::too_many_arguments)]
fn process_batch<Progress: ProgressObserver>(
    options: &TranslateOptions,
    gcp_transform: Option<&GcpTransform>,
    clip_src: Option<&Geometry>,
    clip_dst: Option<&Geometry>,
    wrap_warning_issued: &mut bool,
    output_srs: Option<&SpatialRef>,
    context: &mut TargetLayerContext,
    source: &mut dyn FeatureSource,
    destination: &Dataset,
    source_dataset: &Dataset,
    limit: Option<u64>,
    state: &mut LoopState,
    progress: &Progress
) -> Result<(),CommandError> {

    let layer = destination.layer_by_name(&context.layer_name)?;

    // collection explosion only makes sense into a single geometry field
    let explode_collections = options.explode_collections && (context.dst_geom_fields.len() == 1);

    let forced_flat = options.forced_geometry_type.map(flattened);
    let force_to_polygon = forced_flat == Some(OGRwkbGeometryType::wkbPolygon);
    let force_to_multi_polygon = forced_flat == Some(OGRwkbGeometryType::wkbMultiPolygon);
    let force_to_multi_line_string = forced_flat == Some(OGRwkbGeometryType::wkbMultiLineString);

    let mut in_batch = 0;
    loop {
        if let Some(limit) = limit {
            if in_batch >= limit {
                return Ok(());
            }
        }

        let feature = if let Some(fid) = options.fid {
            // a single requested feature, fetched exactly once
            if state.fid_fetched {
                None
            } else {
                state.fid_fetched = true;
                source.feature_by_id(fid)?
            }
        } else {
            source.next_feature()?
        };
        let mut feature = match feature {
            Some(feature) => feature,
            None => {
                state.done = true;
                return Ok(());
            }
        };

        if (context.features_read == 0) || context.per_feature_ct {
            setup_transforms(context, source.schema(), &feature, options, wrap_warning_issued, progress)?;
        }
        context.features_read += 1;
        state.features_read += 1;

        let mut parts = 0;
        if explode_collections {
            let geometry_index = context.requested_geom_field.unwrap_or(0);
            if let Some(geometry) = feature.geometries.get(geometry_index).and_then(Option::as_ref) {
                if is_collection_type(geometry.geometry_type()) {
                    parts = geometry.geometry_count();
                }
            }
        }
        // a collection with no children still produces one (empty) output
        let iterations = parts.max(1);

        'parts: for part in 0..iterations {

            let defn = layer.defn();
            let mut destination_feature = Feature::new(defn)?;

            // remap the attributes; a failure here is a structural mismatch,
            // so the whole layer aborts rather than just this feature
            for (source_index,destination_index) in context.field_map.iter().enumerate() {
                if let Some(destination_index) = destination_index {
                    if let Some(value) = feature.fields.get(source_index).and_then(Option::as_ref) {
                        destination_feature.field_index(&context.dst_field_names[*destination_index])
                            .and_then(|dst_idx| destination_feature.set_field(dst_idx, value))
                            .map_err(|_| CommandError::FieldRemapFailed(feature.fid,source.schema().name.clone()))?;
                    }
                }
            }

            for geometry_index in 0..context.dst_geom_fields.len() {
                let source_geometry_index = match context.src_geom_index[geometry_index] {
                    Some(source_geometry_index) => source_geometry_index,
                    None => continue
                };

                let geometry = if parts > 0 {
                    // pull the current part out of the collection
                    feature.geometries.get(source_geometry_index).and_then(Option::as_ref)
                        .map(|parent| parent.get_geometry(part).clone())
                } else if context.dst_geom_fields.len() == 1 {
                    // single geometry field and no explosion, move instead of copy
                    feature.take_geometry(source_geometry_index)
                } else {
                    feature.geometries.get(source_geometry_index).and_then(Option::clone)
                };
                let mut geometry = match geometry {
                    Some(geometry) => geometry,
                    None => continue
                };

                if let Some(z_field_index) = context.z_field_index {
                    geometry.assign_uniform_z(feature.field_as_double(z_field_index));
                }

                match options.coordinate_dimension {
                    CoordinateDimension::Two => geometry.force_coordinate_dimension(2),
                    CoordinateDimension::Three => geometry.force_coordinate_dimension(3),
                    CoordinateDimension::MatchLayer => {
                        let declared = context.dst_geom_fields[geometry_index].geometry_type;
                        geometry.force_coordinate_dimension(if is_3d(declared) { 3 } else { 2 });
                    },
                    CoordinateDimension::Unchanged => {}
                }

                match options.geometry_operation {
                    GeometryOperation::Segmentize(distance) if distance > 0.0 => geometry.segmentize_lines(distance),
                    GeometryOperation::SimplifyPreserveTopology(tolerance) if tolerance > 0.0 => {
                        if let Ok(simplified) = geometry.simplify_preserve_topology(tolerance) {
                            geometry = simplified;
                        }
                    },
                    _ => {}
                }

                if let Some(clip) = clip_src {
                    geometry = match geometry.intersection(clip) {
                        Some(clipped) if !clipped.is_empty() => clipped,
                        // an empty intersection just filters the part out
                        _ => continue 'parts
                    };
                }

                let cached = context.transforms[geometry_index].as_ref();
                let transform_options = &context.transform_options[geometry_index];
                if gcp_transform.is_some() || cached.is_some() || !transform_options.is_empty() {
                    match reprojected(geometry, cached.map(|cached| &cached.transform), transform_options, gcp_transform) {
                        Some(transformed) => geometry = transformed,
                        None => {
                            if options.skip_failures {
                                state.skipped += 1;
                                progress.warning(|| format!("Failed to reproject feature {} from layer '{}'.",describe_fid(&feature.fid),source.schema().name));
                                continue 'parts;
                            }
                            return Err(CommandError::ReprojectionFailed(feature.fid,source.schema().name.clone()));
                        }
                    }
                } else if let Some(output_srs) = output_srs {
                    geometry.set_spatial_ref(output_srs.clone());
                }

                if let Some(clip) = clip_dst {
                    geometry = match geometry.intersection(clip) {
                        Some(clipped) if !clipped.is_empty() => clipped,
                        _ => continue 'parts
                    };
                }

                let flat = flattened(geometry.geometry_type());
                if force_to_polygon {
                    geometry = geometry.forced_to_polygon();
                } else if force_to_multi_polygon || (options.promote_to_multi && (flat == OGRwkbGeometryType::wkbPolygon)) {
                    geometry = geometry.forced_to_multi_polygon();
                } else if force_to_multi_line_string || (options.promote_to_multi && (flat == OGRwkbGeometryType::wkbLineString)) {
                    geometry = geometry.forced_to_multi_line_string();
                }

                if geometry_index == 0 {
                    destination_feature.set_geometry(geometry)?;
                } else {
                    destination_feature.set_geometry_at(geometry_index, geometry)?;
                }
            }

            match destination_feature.create(&layer) {
                Ok(()) => state.written += 1,
                Err(_) if options.skip_failures => {
                    state.skipped += 1;
                    progress.warning(|| format!("Unable to write feature {} into layer '{}'.",describe_fid(&feature.fid),context.layer_name));
                },
                Err(_) => return Err(CommandError::FeatureWriteFailed(feature.fid,source.schema().name.clone()))
            }

            in_batch += 1;
        }

        // advisory progress, by feature count or by byte position for
        // streaming sources
        if options.source_file_size > 0 {
            if state.features_read % 1000 == 0 {
                if let Some(bytes) = poll_bytes_read(source_dataset) {
                    progress.update(|| bytes as usize);
                }
            }
        } else {
            progress.update(|| state.features_read as usize);
        }
    }
}
