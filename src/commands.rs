use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use gdal::spatial_ref::AxisMappingStrategy;
use gdal::spatial_ref::SpatialRef;
use gdal::vector::Geometry;
use gdal::Dataset;
use gdal::DatasetOptions;
use gdal::DriverManager;
use gdal::GdalOpenFlags;

use crate::clip::load_clip_geometry;
use crate::errors::CommandError;
use crate::gdal_fixes::DriverFix;
use crate::geometry::geometry_type_from_name;
use crate::geometry::CoordinateDimension;
use crate::geometry::GeometryOperation;
use crate::progress::ProgressObserver;
use crate::transform::GcpTransform;
use crate::transform::GroundControlPoint;
use crate::translate::run_translation;
use crate::translate::TranslateOptions;
use crate::translate::TranslationSession;
use crate::translate::DEFAULT_GROUP_TRANSACTIONS;

pub(crate) trait Task {

    fn run<Progress: ProgressObserver>(self, progress: &mut Progress) -> Result<(),CommandError>;

}

#[derive(Parser)]
#[command(version,about)]
pub(crate) struct Metaphora {

    /// The datasource to write into
    destination: PathBuf,

    /// The datasource to read from
    source: PathBuf,

    /// The layers to translate; all of them if none are named
    layers: Vec<String>,

    #[arg(long,short)]
    /// The destination format driver, used when the destination has to be created
    #[arg(default_value="ESRI Shapefile")]
    format: String,

    #[arg(long)]
    /// Datasource creation options, as NAME=VALUE
    dsco: Vec<String>,

    #[arg(long)]
    /// Layer creation options, as NAME=VALUE
    lco: Vec<String>,

    #[arg(long)]
    /// Append features to existing destination layers instead of creating them
    append: bool,

    #[arg(long)]
    /// Delete and recreate destination layers that already exist
    overwrite: bool,

    #[arg(long)]
    /// Open an existing destination datasource in update mode
    update: bool,

    #[arg(long)]
    /// When appending, create the source fields the destination layer is missing
    add_fields: bool,

    #[arg(long)]
    /// A comma separated list of the fields to copy, in the order to copy them
    select: Option<String>,

    #[arg(long="where")]
    /// An attribute query to filter the source features
    filter: Option<String>,

    #[arg(long)]
    /// A SQL statement to execute against the source; its result set is translated instead of named layers
    sql: Option<String>,

    #[arg(long,num_args=4,allow_negative_numbers=true)]
    /// A rectangular spatial filter on the source features, as xmin ymin xmax ymax
    spat: Option<Vec<f64>>,

    #[arg(long)]
    /// Override the spatial reference of the source layers
    s_srs: Option<String>,

    #[arg(long)]
    /// Reproject the output into this spatial reference
    t_srs: Option<String>,

    #[arg(long)]
    /// Assign this spatial reference to the output without reprojecting; NULL or NONE removes it
    a_srs: Option<String>,

    #[arg(long)]
    /// Translate only the feature with this id
    fid: Option<u64>,

    #[arg(long)]
    /// The name for the destination layer, defaults to the source layer name
    nln: Option<String>,

    #[arg(long)]
    /// Force the output geometry type (for example MULTIPOLYGON or LINESTRING25D), or PROMOTE_TO_MULTI
    nlt: Option<String>,

    #[arg(long)]
    /// Force the output coordinate dimension: 2, 3, or layer_dim
    dim: Option<String>,

    #[arg(long,default_value_t=DEFAULT_GROUP_TRANSACTIONS)]
    /// How many features to group into each destination transaction
    gt: u64,

    #[arg(long)]
    /// Drop features that fail to translate instead of aborting, isolating each feature in its own transaction
    skip_failures: bool,

    #[arg(long)]
    /// Write one destination feature per part of a multi-geometry source feature
    explode_collections: bool,

    #[arg(long)]
    /// Flatten multi-valued attribute fields into numbered scalar fields
    split_list_fields: bool,

    #[arg(long)]
    /// The most scalar fields any one list field may flatten into
    max_subfields: Option<usize>,

    #[arg(long)]
    /// Take a uniform elevation for every geometry from this attribute field
    zfield: Option<String>,

    #[arg(long,allow_hyphen_values=true)]
    /// A ground control point as pixel,line,easting,northing with an optional fifth elevation value; repeatable
    gcp: Vec<GroundControlPoint>,

    #[arg(long)]
    /// Derive a thin-plate-spline transform from the ground control points instead of a polynomial one
    tps: bool,

    #[arg(long,allow_negative_numbers=true)]
    /// The order of the polynomial fitted to the ground control points; 0 picks one automatically
    order: Option<i32>,

    #[arg(long)]
    /// Either the word 'identity' or a comma separated destination field index for every source field, -1 dropping it; requires --append
    fieldmap: Option<String>,

    #[arg(long)]
    /// A comma separated list of field types to create as strings instead, or All
    field_type_to_string: Option<String>,

    #[arg(long)]
    /// Discard the field width and precision declared by the source
    unset_field_width: bool,

    #[arg(long)]
    /// Split geometries crossing the dateline meridian
    wrap_dateline: bool,

    #[arg(long,default_value="10")]
    /// Offset in degrees from the dateline within which geometries are split
    dateline_offset: String,

    #[arg(long,allow_negative_numbers=true)]
    /// Densify geometries so no segment is longer than this distance
    segmentize: Option<f64>,

    #[arg(long,allow_negative_numbers=true)]
    /// Simplify geometries with this tolerance, preserving topology
    simplify: Option<f64>,

    #[arg(long)]
    /// Clip the translated geometries against this polygon: WKT, a datasource, or 'spat_extent'
    clipsrc: Option<String>,

    #[arg(long)]
    /// A SQL statement selecting the source-side clip polygons
    clipsrcsql: Option<String>,

    #[arg(long)]
    /// The layer holding the source-side clip polygons
    clipsrclayer: Option<String>,

    #[arg(long)]
    /// An attribute filter on the source-side clip polygons
    clipsrcwhere: Option<String>,

    #[arg(long)]
    /// Clip the reprojected geometries against this polygon: WKT or a datasource
    clipdst: Option<String>,

    #[arg(long)]
    /// A SQL statement selecting the destination-side clip polygons
    clipdstsql: Option<String>,

    #[arg(long)]
    /// The layer holding the destination-side clip polygons
    clipdstlayer: Option<String>,

    #[arg(long)]
    /// An attribute filter on the destination-side clip polygons
    clipdstwhere: Option<String>,

    #[arg(long)]
    /// Match appended field names case-insensitively when the exact name is absent
    relaxed_field_name_match: bool,

    #[arg(long)]
    /// Round-robin a single read across all layers, for sources that can only be read once
    interleaved: bool,

}

fn parse_srs(definition: &str) -> Result<SpatialRef,CommandError> {
    let mut srs = SpatialRef::from_definition(definition).map_err(|_| CommandError::InvalidSrsDefinition(definition.to_owned()))?;
    // the traditional axis order, so coordinates mean what command-line users expect
    srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
    Ok(srs)
}

fn bbox_polygon(bounds: &[f64]) -> Result<Geometry,CommandError> {
    let (xmin,ymin,xmax,ymax) = (bounds[0],bounds[1],bounds[2],bounds[3]);
    Ok(Geometry::from_wkt(&format!("POLYGON(({} {},{} {},{} {},{} {},{} {}))",
        xmin,ymin,xmin,ymax,xmax,ymax,xmax,ymin,xmin,ymin))?)
}

fn split_list(text: &Option<String>) -> Option<Vec<String>> {
    text.as_ref().map(|text| text.split(',').map(|part| part.trim().to_owned()).collect())
}

fn resolve_clip_operand(specification: &Option<String>, sql: &Option<String>, layer: &Option<String>, filter: &Option<String>, spatial_filter: &Option<Geometry>, allow_spat_extent: bool, side: &'static str) -> Result<Option<Geometry>,CommandError> {
    let specification = match specification {
        Some(specification) => specification.trim(),
        None => return Ok(None)
    };
    let upper = specification.to_uppercase();
    if upper.starts_with("POLYGON") || upper.starts_with("MULTIPOLYGON") {
        match Geometry::from_wkt(specification) {
            Ok(geometry) => Ok(Some(geometry)),
            Err(_) => Err(CommandError::InvalidClipGeometry(side))
        }
    } else if allow_spat_extent && (upper == "SPAT_EXTENT") {
        match spatial_filter {
            Some(geometry) => Ok(Some(geometry.clone())),
            None => Err(CommandError::ConflictingOptions("--clipsrc spat_extent requires --spat"))
        }
    } else {
        match load_clip_geometry(Path::new(specification), sql.as_deref(), layer.as_deref(), filter.as_deref(), side) {
            Ok(geometry) => Ok(geometry),
            Err(err @ CommandError::InvalidClipGeometry(_)) => Err(err),
            Err(_) => Err(CommandError::ClipGeometryNotLoaded(side))
        }
    }
}

impl Metaphora {

    fn validate(&self) -> Result<(),CommandError> {
        if self.fieldmap.is_some() && !self.append {
            return Err(CommandError::ConflictingOptions("if --fieldmap is specified, --append must also be specified"));
        }
        if self.fieldmap.is_some() && self.add_fields {
            return Err(CommandError::ConflictingOptions("--fieldmap cannot be used together with --add-fields"));
        }
        if self.s_srs.is_some() && self.t_srs.is_none() {
            return Err(CommandError::ConflictingOptions("if --s-srs is specified, --t-srs must also be specified"));
        }
        if self.t_srs.is_some() && self.a_srs.is_some() {
            return Err(CommandError::ConflictingOptions("--t-srs and --a-srs cannot be combined"));
        }
        if self.sql.is_some() && (self.filter.is_some() || !self.layers.is_empty()) {
            return Err(CommandError::ConflictingOptions("a SQL statement cannot be combined with --where or named layers"));
        }
        if self.segmentize.is_some() && self.simplify.is_some() {
            return Err(CommandError::ConflictingOptions("--segmentize and --simplify cannot be combined"));
        }
        if self.interleaved && self.split_list_fields {
            return Err(CommandError::SplitNotSupportedInterleaved);
        }
        Ok(())
    }

    fn open_or_create_destination(&self) -> Result<Dataset,CommandError> {
        let update_access = self.update || self.append || self.add_fields || self.overwrite;
        if update_access {
            let options = DatasetOptions {
                open_flags: GdalOpenFlags::GDAL_OF_VECTOR | GdalOpenFlags::GDAL_OF_UPDATE,
                ..Default::default()
            };
            match Dataset::open_ex(&self.destination, options) {
                Ok(dataset) => return Ok(dataset),
                Err(err) => if self.update && !(self.overwrite || self.append) {
                    // plain --update has nothing to fall back on
                    return Err(err.into());
                }
            }
        }
        let driver = DriverManager::get_driver_by_name(&self.format).map_err(|_| CommandError::DriverNotFound(self.format.clone()))?;
        let created = if self.dsco.is_empty() {
            driver.create_vector_only(&self.destination)
        } else {
            driver.create_vector_with_options(&self.destination, &self.dsco)
        };
        created.map_err(|_| CommandError::DestinationNotCreated(self.destination.display().to_string()))
    }

}

impl Task for Metaphora {

    fn run<Progress: ProgressObserver>(self, progress: &mut Progress) -> Result<(),CommandError> {

        self.validate()?;

        let mut promote_to_multi = false;
        let forced_geometry_type = match &self.nlt {
            Some(name) if name.eq_ignore_ascii_case("PROMOTE_TO_MULTI") => {
                promote_to_multi = true;
                None
            },
            Some(name) => Some(geometry_type_from_name(name)?),
            None => None
        };

        let coordinate_dimension = match &self.dim {
            Some(text) => CoordinateDimension::parse(text)?,
            None => CoordinateDimension::Unchanged
        };

        let geometry_operation = if let Some(distance) = self.segmentize {
            GeometryOperation::Segmentize(distance)
        } else if let Some(tolerance) = self.simplify {
            GeometryOperation::SimplifyPreserveTopology(tolerance)
        } else {
            GeometryOperation::NoOp
        };

        let (output_srs,nullify_output_srs,reproject) = if let Some(definition) = &self.t_srs {
            (Some(parse_srs(definition)?),false,true)
        } else if let Some(definition) = &self.a_srs {
            if definition.eq_ignore_ascii_case("NULL") || definition.eq_ignore_ascii_case("NONE") {
                (None,true,false)
            } else {
                (Some(parse_srs(definition)?),false,false)
            }
        } else {
            (None,false,false)
        };

        let source_srs = match &self.s_srs {
            Some(definition) => Some(parse_srs(definition)?),
            None => None
        };

        let spatial_filter = match &self.spat {
            Some(bounds) => Some(bbox_polygon(bounds)?),
            None => None
        };

        let clip_src = resolve_clip_operand(&self.clipsrc, &self.clipsrcsql, &self.clipsrclayer, &self.clipsrcwhere, &spatial_filter, true, "source")?;
        let clip_dst = resolve_clip_operand(&self.clipdst, &self.clipdstsql, &self.clipdstlayer, &self.clipdstwhere, &spatial_filter, false, "destination")?;

        let gcp_transform = if self.gcp.is_empty() {
            None
        } else {
            let order = if self.tps {
                -1
            } else {
                self.order.unwrap_or(0)
            };
            Some(GcpTransform::new(&self.gcp, order)?)
        };

        let source_dataset = Dataset::open_ex(&self.source, DatasetOptions {
            open_flags: GdalOpenFlags::GDAL_OF_VECTOR,
            ..Default::default()
        })?;

        // Streaming sources get byte-based progress and must be read interleaved.
        let source_is_streaming = source_dataset.driver().short_name() == "OSM";
        let source_file_size = if source_is_streaming {
            std::fs::metadata(&self.source).map(|metadata| metadata.len()).unwrap_or(0)
        } else {
            0
        };

        let mut destination = self.open_or_create_destination()?;

        // Writing a single layer into a shapefile that already exists under the
        // target name really means appending to that file's own layer.
        let mut new_layer_name = self.nln.clone();
        if new_layer_name.is_none()
            && (self.format == "ESRI Shapefile")
            && (self.sql.is_some() || self.layers.len() == 1)
            && self.destination.is_file() {
            new_layer_name = self.destination.file_stem().map(|stem| stem.to_string_lossy().into_owned());
        }

        let options = TranslateOptions {
            layer_names: self.layers.clone(),
            sql_statement: self.sql.clone(),
            new_layer_name,
            layer_creation_options: self.lco.clone(),
            selected_fields: split_list(&self.select),
            field_map: split_list(&self.fieldmap),
            field_types_to_string: split_list(&self.field_type_to_string).unwrap_or_default(),
            unset_field_width: self.unset_field_width,
            append: self.append || self.add_fields,
            add_missing_fields: self.add_fields,
            overwrite: self.overwrite,
            exact_field_name_match: !self.relaxed_field_name_match,
            output_srs,
            nullify_output_srs,
            reproject,
            source_srs,
            forced_geometry_type,
            promote_to_multi,
            coordinate_dimension,
            geometry_operation,
            explode_collections: self.explode_collections,
            z_field: self.zfield.clone(),
            attribute_filter: self.filter.clone(),
            spatial_filter,
            fid: self.fid,
            wrap_dateline: self.wrap_dateline,
            dateline_offset: self.dateline_offset.clone(),
            split_list_fields: self.split_list_fields,
            max_split_list_subfields: self.max_subfields,
            group_transactions: self.gt,
            skip_failures: self.skip_failures,
            interleaved: self.interleaved || source_is_streaming,
            source_file_size,
        };

        let mut session = TranslationSession::new(options);
        session.gcp_transform = gcp_transform;
        session.clip_src = clip_src;
        session.clip_dst = clip_dst;

        let summary = run_translation(&mut session, &source_dataset, &mut destination, progress)?;
        if summary.features_skipped > 0 {
            progress.warning(|| format!("{} features were skipped.",summary.features_skipped));
        }

        Ok(())
    }

}
