use std::error::Error;
use std::fmt::Display;

pub(crate) use gdal::errors::GdalError;

pub(crate) use clap::error::Error as ArgumentError;

#[derive(Debug)]
pub(crate) enum CommandError {
    GdalError(GdalError),
    ConflictingOptions(&'static str),
    DriverNotFound(String),
    DestinationNotCreated(String),
    InvalidGeometryType(String),
    InvalidCoordinateDimension(String),
    InvalidSrsDefinition(String),
    InvalidClipGeometry(&'static str),
    ClipGeometryNotLoaded(&'static str),
    ClipLayerNotFound(String),
    LayerNotFound(String),
    FieldNotFound(String,String),
    MultipleGeometryFieldsUnsupported,
    CannotCreateLayer(String),
    LayerAlreadyExists(String),
    InvalidFieldMap(String),
    MissingSourceSrs(String),
    TransformCreationFailed(String,String),
    GcpTransformCreationFailed,
    SplitNotSupportedInterleaved,
    FieldRemapFailed(Option<u64>,String),
    ReprojectionFailed(Option<u64>,String),
    FeatureWriteFailed(Option<u64>,String),
    Cancelled,
}

pub(crate) fn describe_fid(fid: &Option<u64>) -> String {
    match fid {
        Some(fid) => fid.to_string(),
        None => "<no fid>".to_owned()
    }
}

impl Error for CommandError {

}

impl Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GdalError(a) => write!(f,"gdal: {}",a),
            Self::ConflictingOptions(a) => write!(f,"{}",a),
            Self::DriverNotFound(a) => write!(f,"Unable to find driver '{}'.",a),
            Self::DestinationNotCreated(a) => write!(f,"Could not create the destination datasource '{}'.",a),
            Self::InvalidGeometryType(a) => write!(f,"Geometry type '{}' is not recognised.",a),
            Self::InvalidCoordinateDimension(a) => write!(f,"Coordinate dimension '{}' is not handled, expected 2, 3 or layer_dim.",a),
            Self::InvalidSrsDefinition(a) => write!(f,"Failed to process SRS definition: {}",a),
            Self::InvalidClipGeometry(a) => write!(f,"The {} clip geometry must be of polygon type.",a),
            Self::ClipGeometryNotLoaded(a) => write!(f,"Cannot load the {} clip geometry.",a),
            Self::ClipLayerNotFound(a) => write!(f,"Failed to identify the clip source layer in '{}'.",a),
            Self::LayerNotFound(a) => write!(f,"Couldn't fetch requested layer '{}'.",a),
            Self::FieldNotFound(field,layer) => write!(f,"Field '{}' was not found in source layer '{}'.",field,layer),
            Self::MultipleGeometryFieldsUnsupported => write!(f,"Several geometry fields were requested, but the output datasource does not support multiple geometry fields."),
            Self::CannotCreateLayer(a) => write!(f,"Layer '{}' was not found, and the output datasource does not support creating layers.",a),
            Self::LayerAlreadyExists(a) => write!(f,"Layer '{}' already exists, and appending was not requested. Consider using --append or --overwrite.",a),
            Self::InvalidFieldMap(a) => write!(f,"Invalid field map: {}",a),
            Self::MissingSourceSrs(a) => write!(f,"Can't transform coordinates, source layer '{}' has no coordinate system. Use --s-srs to set one.",a),
            Self::TransformCreationFailed(source,target) => write!(f,"Failed to create a coordinate transformation between the following coordinate systems. They may not be transformable, or projection services may not be available.\nSource:\n{}\nTarget:\n{}",source,target),
            Self::GcpTransformCreationFailed => write!(f,"Failed to derive a transformation from the supplied ground control points."),
            Self::SplitNotSupportedInterleaved => write!(f,"Splitting list fields is not supported when reading layers interleaved."),
            Self::FieldRemapFailed(fid,layer) => write!(f,"Unable to translate the attributes of feature {} from layer '{}'.",describe_fid(fid),layer),
            Self::ReprojectionFailed(fid,layer) => write!(f,"Failed to reproject feature {} from layer '{}' (geometry probably out of the source or destination SRS).",describe_fid(fid),layer),
            Self::FeatureWriteFailed(fid,layer) => write!(f,"Unable to write feature {} from layer '{}'.",describe_fid(fid),layer),
            Self::Cancelled => write!(f,"The translation was cancelled."),
        }
    }
}

impl From<GdalError> for CommandError {

    fn from(value: GdalError) -> Self {
        Self::GdalError(value)
    }
}

#[derive(Debug)]
pub(crate) enum ProgramError {
    ArgumentError(ArgumentError),
    CommandError(CommandError)
}

impl Error for ProgramError {

}

impl Display for ProgramError {

    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArgumentError(a) => write!(f,"{}",a),
            Self::CommandError(a) => write!(f,"{}",a),
        }
    }
}

impl From<ArgumentError> for ProgramError {

    fn from(value: ArgumentError) -> Self {
        Self::ArgumentError(value)
    }
}

impl From<CommandError> for ProgramError {

    fn from(value: CommandError) -> Self {
        Self::CommandError(value)
    }
}
