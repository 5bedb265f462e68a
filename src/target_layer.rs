use gdal::vector::field_type_to_name;
use gdal::vector::FieldDefn;
use gdal::vector::LayerAccess;
use gdal::vector::OGRFieldType;
use gdal::vector::OGRwkbGeometryType;
use gdal::Dataset;
use gdal::vector::LayerOptions;
use indexmap::IndexMap;

use crate::errors::CommandError;
use crate::gdal_fixes::DatasetFix;
use crate::gdal_fixes::LayerFix;
use crate::gdal_fixes::CAP_CREATE_GEOM_FIELD_AFTER_CREATE_LAYER;
use crate::gdal_fixes::CAP_CREATE_LAYER;
use crate::geometry::demoted_for_explosion;
use crate::geometry::forced_dimension;
use crate::geometry::promoted_to_multi;
use crate::geometry::CoordinateDimension;
use crate::layer_source::AttributeField;
use crate::layer_source::FeatureSource;
use crate::progress::ProgressObserver;
use crate::transform::CachedTransform;
use crate::translate::TranslateOptions;

pub(crate) struct DestinationGeometryField {
    pub(crate) name: String,
    pub(crate) geometry_type: OGRwkbGeometryType::Type,
}

// Everything the translation loop needs to know about one destination layer.
// Built once per layer by setup_target_layer, mutated while the layer streams,
// dropped when the layer is done.
pub(crate) struct TargetLayerContext {
    pub(crate) layer_name: String,
    pub(crate) features_read: u64,
    // true once a layer has been caught carrying geometry-attached spatial
    // references, which forces transform resolution on every feature
    pub(crate) per_feature_ct: bool,
    pub(crate) transforms: Vec<Option<CachedTransform>>,
    pub(crate) transform_options: Vec<Vec<(&'static str,String)>>,
    pub(crate) src_geom_index: Vec<Option<usize>>,
    // source field position to destination field position, None drops the field
    pub(crate) field_map: Vec<Option<usize>>,
    pub(crate) dst_field_names: Vec<String>,
    pub(crate) dst_geom_fields: Vec<DestinationGeometryField>,
    pub(crate) z_field_index: Option<usize>,
    pub(crate) requested_geom_field: Option<usize>,
}

fn destination_field_names(destination: &Dataset, layer_name: &str) -> Result<Vec<String>,CommandError> {
    let layer = destination.layer_by_name(layer_name)?;
    let names = layer.defn().fields().map(|field| field.name()).collect();
    Ok(names)
}

fn create_destination_field(destination: &Dataset, layer_name: &str, name: &str, field: &AttributeField, options: &TranslateOptions) -> Result<(),CommandError> {
    let layer = destination.layer_by_name(layer_name)?;
    let coerced = options.field_types_to_string.iter().any(|requested| {
        requested.eq_ignore_ascii_case("All") || requested.eq_ignore_ascii_case(&field_type_to_name(field.field_type))
    });
    let field_type = if coerced {
        OGRFieldType::OFTString
    } else {
        field.field_type
    };
    let definition = FieldDefn::new(name, field_type)?;
    if options.unset_field_width {
        definition.set_width(0);
        definition.set_precision(0);
    } else {
        if field.width > 0 {
            definition.set_width(field.width);
        }
        if field.precision > 0 {
            definition.set_precision(field.precision);
        }
    }
    definition.add_to_layer(&layer)?;
    Ok(())
}

// The schema reconciler. Locates or creates the destination layer, reconciles
// the attribute schemas under one of four mutually exclusive policies, and
// hands back the context the translation loop runs on. Any failure here is
// fatal for this layer; the caller decides whether the run continues.
pub(crate) fn setup_target_layer<Progress: ProgressObserver>(
    source: &mut dyn FeatureSource,
    destination: &mut Dataset,
    options: &TranslateOptions,
    layer_name: &str,
    progress: &mut Progress
) -> Result<TargetLayerContext,CommandError> {

    let schema = source.schema();

    // ------------------------------------------------------------------
    // Find requested geometry fields among the selected names.
    // ------------------------------------------------------------------
    let mut requested_geom_fields = Vec::new();
    if let (Some(selected),false) = (&options.selected_fields,options.append) {
        for name in selected {
            if schema.field_index(name).is_some() {
                // a plain attribute, the field policies below deal with it
            } else if let Some(index) = schema.geom_field_index(name) {
                requested_geom_fields.push(index);
            } else if options.skip_failures {
                progress.warning(|| format!("Field '{}' was not found in source layer '{}'.",name,schema.name));
            } else {
                return Err(CommandError::FieldNotFound(name.clone(),schema.name.clone()));
            }
        }
        if requested_geom_fields.len() > 1 && !destination.has_dataset_capability(CAP_CREATE_GEOM_FIELD_AFTER_CREATE_LAYER) {
            if !options.skip_failures {
                return Err(CommandError::MultipleGeometryFieldsUnsupported);
            }
            requested_geom_fields.clear();
        }
    }

    let mut output_srs = options.output_srs.clone();
    if output_srs.is_none() && !options.nullify_output_srs {
        if (schema.geom_fields.len() == 1) || requested_geom_fields.is_empty() {
            output_srs = schema.geom_fields.first().and_then(|field| field.srs.clone());
        } else if requested_geom_fields.len() == 1 {
            output_srs = schema.geom_fields[requested_geom_fields[0]].srs.clone();
        }
    }

    // ------------------------------------------------------------------
    // Locate the destination layer, deleting it first if it is to be
    // overwritten.
    // ------------------------------------------------------------------
    let mut layer_exists = destination.layer_by_name(layer_name).is_ok();
    if layer_exists && options.overwrite {
        let index = destination.layers().position(|layer| layer.name() == layer_name);
        if let Some(index) = index {
            destination.delete_layer_at(index)?;
        }
        layer_exists = false;
    }

    let mut append = options.append;
    if !layer_exists {
        if !destination.has_dataset_capability(CAP_CREATE_LAYER) {
            return Err(CommandError::CannotCreateLayer(layer_name.to_owned()));
        }

        // Output geometry type precedence: explicit override, then the single
        // relevant source geometry field, then none at all.
        let forced_type = options.forced_geometry_type;
        let mut geometry_type = match forced_type {
            Some(forced) => forced,
            None => {
                let mut resolved = if requested_geom_fields.is_empty() {
                    schema.geom_fields.first().map(|field| field.geometry_type).unwrap_or(OGRwkbGeometryType::wkbNone)
                } else if requested_geom_fields.len() == 1 {
                    schema.geom_fields[requested_geom_fields[0]].geometry_type
                } else {
                    OGRwkbGeometryType::wkbNone
                };
                if options.promote_to_multi {
                    resolved = promoted_to_multi(resolved);
                }
                if options.explode_collections {
                    resolved = demoted_for_explosion(resolved);
                }
                if options.z_field.is_some() {
                    // an injected elevation makes everything three-dimensional
                    resolved = forced_dimension(resolved, CoordinateDimension::Three);
                }
                resolved
            }
        };
        geometry_type = forced_dimension(geometry_type, options.coordinate_dimension);

        let supports_geom_field_after = destination.has_dataset_capability(CAP_CREATE_GEOM_FIELD_AFTER_CREATE_LAYER);
        let create_type = if supports_geom_field_after &&
            ((requested_geom_fields.is_empty() && schema.geom_fields.len() > 1) || (requested_geom_fields.len() == 1)) {
            OGRwkbGeometryType::wkbNone
        } else {
            geometry_type
        };

        let creation_options: Vec<&str> = options.layer_creation_options.iter().map(String::as_str).collect();
        {
            let created = destination.create_layer(LayerOptions {
                name: layer_name,
                srs: output_srs.as_ref(),
                ty: create_type,
                options: if creation_options.is_empty() {
                    None
                } else {
                    Some(&creation_options)
                }
            });
            if created.is_err() {
                return Err(CommandError::CannotCreateLayer(layer_name.to_owned()));
            }
        }

        let mut explicit_geom_fields = requested_geom_fields.clone();
        if explicit_geom_fields.is_empty() && schema.geom_fields.len() > 1 && supports_geom_field_after {
            explicit_geom_fields = (0..schema.geom_fields.len()).collect();
        }
        if (explicit_geom_fields.len() > 1) || (explicit_geom_fields.len() == 1 && supports_geom_field_after) {
            let mut layer = destination.layer_by_name(layer_name)?;
            for index in &explicit_geom_fields {
                let field = &schema.geom_fields[*index];
                let field_type = if forced_type.is_some() {
                    geometry_type
                } else {
                    let mut resolved = field.geometry_type;
                    if options.promote_to_multi {
                        resolved = promoted_to_multi(resolved);
                    }
                    forced_dimension(resolved, options.coordinate_dimension)
                };
                // an explicitly requested output SRS beats the field's own
                let srs = match &options.output_srs {
                    Some(srs) => Some(srs),
                    None => field.srs.as_ref()
                };
                layer.add_geometry_field(&field.name, field_type, srs)?;
            }
        }

        append = false;
    } else if !append {
        return Err(CommandError::LayerAlreadyExists(layer_name.to_owned()));
    } else if !options.layer_creation_options.is_empty() {
        progress.warning(|| "Layer creation options are ignored when appending to an existing layer.");
    }

    // ------------------------------------------------------------------
    // Attribute field reconciliation, one of four policies.
    // ------------------------------------------------------------------
    let source_field_count = schema.fields.len();
    let mut field_map: Vec<Option<usize>> = vec![None; source_field_count];
    let mut ignorable: Option<Vec<String>> = None;

    if let (Some(map_spec),true) = (&options.field_map,append) {
        // policy 1: an explicit map, literal "identity" or one destination
        // index per source field
        let destination_count = destination_field_names(destination, layer_name)?.len();
        if (map_spec.len() == 1) && (map_spec[0] == "identity") {
            for (index,entry) in field_map.iter_mut().enumerate() {
                if index >= destination_count {
                    return Err(CommandError::InvalidFieldMap(format!("identity mapping needs at least {} destination fields",source_field_count)));
                }
                *entry = Some(index);
            }
        } else {
            if map_spec.len() != source_field_count {
                return Err(CommandError::InvalidFieldMap("it should contain the value 'identity' or as many indexes as there are source fields".to_owned()));
            }
            for (index,token) in map_spec.iter().enumerate() {
                let value: i64 = token.trim().parse().map_err(|_| CommandError::InvalidFieldMap(format!("'{}' is not a field index",token)))?;
                if value < 0 {
                    field_map[index] = None;
                } else if (value as usize) < destination_count {
                    field_map[index] = Some(value as usize);
                } else {
                    return Err(CommandError::InvalidFieldMap(format!("invalid destination field index {}",value)));
                }
            }
        }
    } else if let (Some(selected),false) = (&options.selected_fields,append) {
        // policy 2: only the selected fields, in the order they were selected
        let mut destination_names = destination_field_names(destination, layer_name)?;
        for name in selected {
            if let Some(source_index) = schema.field_index(name) {
                let field = &schema.fields[source_index];
                // the field may already exist from layer creation
                if let Some(existing) = destination_names.iter().position(|existing| existing.eq_ignore_ascii_case(&field.name)) {
                    field_map[source_index] = Some(existing);
                } else {
                    create_destination_field(destination, layer_name, &field.name, field, options)?;
                    field_map[source_index] = Some(destination_names.len());
                    destination_names.push(field.name.clone());
                }
            }
        }
        // Everything nobody asked for can be skipped by the reader, except
        // fields the attribute filter or the elevation source still need.
        let mut ignored = Vec::new();
        for field in &schema.fields {
            let requested = selected.iter().any(|name| name.eq_ignore_ascii_case(&field.name))
                || matches!(&options.attribute_filter, Some(filter) if filter.to_lowercase().contains(&field.name.to_lowercase()))
                || matches!(&options.z_field, Some(z_field) if z_field.eq_ignore_ascii_case(&field.name));
            if !requested {
                ignored.push(field.name.clone());
            }
        }
        ignorable = Some(ignored);
    } else if !append || options.add_missing_fields {
        // policy 3: copy every source field, creating the missing ones and
        // renaming on collision
        let initial_names = destination_field_names(destination, layer_name)?;
        // case-insensitive snapshot before anything is created, first
        // occurrence wins when the destination already has duplicates
        let mut existing = IndexMap::new();
        for (index,name) in initial_names.iter().enumerate() {
            let upper = name.to_uppercase();
            if !existing.contains_key(&upper) {
                let _ = existing.insert(upper,index);
            }
        }
        let mut destination_names = initial_names;
        for (source_index,field) in schema.fields.iter().enumerate() {
            if let Some(index) = existing.get(&field.name.to_uppercase()) {
                field_map[source_index] = Some(*index);
                continue;
            }
            let mut name = field.name.clone();
            if destination_names.iter().any(|taken| taken.eq_ignore_ascii_case(&name)) {
                // probe numeric suffixes until the name collides with neither
                // the destination nor the source schema
                let mut attempt = 1;
                loop {
                    attempt += 1;
                    let candidate = format!("{}{}",field.name,attempt);
                    if !destination_names.iter().any(|taken| taken.eq_ignore_ascii_case(&candidate))
                        && schema.field_index(&candidate).is_none() {
                        name = candidate;
                        break;
                    }
                }
            }
            create_destination_field(destination, layer_name, &name, field, options)?;
            if name != field.name {
                progress.warning(|| format!("Field '{}' already exists. Renaming it as '{}'.",field.name,name));
            }
            field_map[source_index] = Some(destination_names.len());
            destination_names.push(name);
        }
    } else {
        // policy 4: plain append, match each source field by name and drop the
        // rest quietly
        let destination_names = destination_field_names(destination, layer_name)?;
        for (source_index,field) in schema.fields.iter().enumerate() {
            let found = destination_names.iter().position(|name| name == &field.name)
                .or_else(|| if options.exact_field_name_match {
                    None
                } else {
                    destination_names.iter().position(|name| name.eq_ignore_ascii_case(&field.name))
                });
            match found {
                Some(index) => field_map[source_index] = Some(index),
                None => progress.message(|| format!("Skipping field '{}' not found in destination layer '{}'.",field.name,layer_name))
            }
        }
    }

    let z_field_index = options.z_field.as_ref().and_then(|name| schema.field_index(name));
    let requested_geom_field = if requested_geom_fields.len() == 1 {
        Some(requested_geom_fields[0])
    } else {
        None
    };

    if let Some(ignored) = ignorable {
        if !ignored.is_empty() {
            let _ = source.ignore_fields(&ignored)?;
        }
    }

    let (dst_field_names,dst_geom_fields) = {
        let layer = destination.layer_by_name(layer_name)?;
        let defn = layer.defn();
        let names: Vec<String> = defn.fields().map(|field| field.name()).collect();
        let geom_fields: Vec<DestinationGeometryField> = defn.geom_fields().map(|field| DestinationGeometryField {
            name: field.name(),
            geometry_type: field.field_type()
        }).collect();
        (names,geom_fields)
    };

    let geom_field_count = dst_geom_fields.len();
    Ok(TargetLayerContext {
        layer_name: layer_name.to_owned(),
        features_read: 0,
        per_feature_ct: false,
        transforms: (0..geom_field_count).map(|_| None).collect(),
        transform_options: vec![Vec::new(); geom_field_count],
        src_geom_index: vec![None; geom_field_count],
        field_map,
        dst_field_names,
        dst_geom_fields,
        z_field_index,
        requested_geom_field,
    })
}
