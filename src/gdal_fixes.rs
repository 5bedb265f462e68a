use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::CString;
use std::path::Path;
use std::ptr::null_mut;

use gdal::cpl::CslStringList;
use gdal::errors::GdalError;
use gdal::spatial_ref::CoordTransform;
use gdal::spatial_ref::SpatialRef;
use gdal::vector::Feature;
use gdal::vector::Geometry;
use gdal::vector::LayerAccess;
use gdal::vector::OGRwkbGeometryType;
use gdal::Dataset;
use gdal::Driver;
use gdal_sys::OGRErr;

// This module collects the OGR entry points that the gdal crate doesn't wrap yet.
// FUTURE: Remove each of these once it's implemented in gdal itself.

// Capability strings from ogr_core.h. The crate wraps the layer-level ones
// (LayerCaps) but not the dataset-level ones.
pub(crate) const CAP_CREATE_LAYER: &str = "CreateLayer";
pub(crate) const CAP_CREATE_GEOM_FIELD_AFTER_CREATE_LAYER: &str = "CreateGeomFieldAfterCreateLayer";

// Takes ownership of a raw geometry handle. with_c_geometry is private to the gdal
// crate, so the handle is cloned out of an unowned wrapper and then released here.
unsafe fn adopt_geometry(handle: gdal_sys::OGRGeometryH) -> Geometry {
    let borrowed = Geometry::lazy_feature_geometry();
    borrowed.set_c_geometry(handle);
    let owned = borrowed.clone();
    gdal_sys::OGR_G_DestroyGeometry(handle);
    owned
}

pub(crate) trait DatasetFix {

    fn has_dataset_capability(&self, capability: &str) -> bool;

    fn delete_layer_at(&mut self, index: usize) -> Result<(),GdalError>;

}

impl DatasetFix for Dataset {

    fn has_dataset_capability(&self, capability: &str) -> bool {
        let c_capability = match CString::new(capability) {
            Ok(c_capability) => c_capability,
            Err(_) => return false
        };
        unsafe { gdal_sys::GDALDatasetTestCapability(self.c_dataset(), c_capability.as_ptr()) != 0 }
    }

    fn delete_layer_at(&mut self, index: usize) -> Result<(),GdalError> {
        let rv = unsafe { gdal_sys::GDALDatasetDeleteLayer(self.c_dataset(), index as c_int) };
        if rv != OGRErr::OGRERR_NONE {
            return Err(GdalError::OgrError {
                err: rv,
                method_name: "GDALDatasetDeleteLayer",
            });
        }
        Ok(())
    }

}

pub(crate) trait DriverFix {

    fn create_vector_with_options(&self, path: &Path, options: &[String]) -> Result<Dataset,GdalError>;

}

impl DriverFix for Driver {

    // create_vector_only has no way to pass datasource creation options through
    fn create_vector_with_options(&self, path: &Path, options: &[String]) -> Result<Dataset,GdalError> {
        let c_path = CString::new(path.to_string_lossy().as_ref())?;
        let mut list = CslStringList::new();
        for option in options {
            if let Some((name,value)) = option.split_once('=') {
                list.set_name_value(name, value)?;
            }
        }
        unsafe {
            let c_dataset = gdal_sys::GDALCreate(self.c_driver(), c_path.as_ptr(), 0, 0, 0, gdal_sys::GDALDataType::GDT_Unknown, list.as_ptr());
            if c_dataset.is_null() {
                Err(GdalError::NullPointer {
                    method_name: "GDALCreate",
                    msg: path.display().to_string(),
                })
            } else {
                Ok(Dataset::from_c_dataset(c_dataset))
            }
        }
    }

}

pub(crate) trait LayerFix {

    fn pull_next_feature(&mut self) -> Option<Feature<'_>>;

    fn rewind(&mut self);

    fn set_ignored_field_names(&mut self, names: &[String]) -> Result<(),GdalError>;

    fn add_geometry_field(&mut self, name: &str, geometry_type: OGRwkbGeometryType::Type, srs: Option<&SpatialRef>) -> Result<(),GdalError>;

}

impl<SomeLayer: LayerAccess> LayerFix for SomeLayer {

    // The features() iterator rewinds the layer every time it is created, which
    // makes it useless for pulling features one at a time across interleaved
    // passes. This is the raw sequential read that the iterator is built on.
    fn pull_next_feature(&mut self) -> Option<Feature<'_>> {
        unsafe {
            let c_feature = gdal_sys::OGR_L_GetNextFeature(self.c_layer());
            if c_feature.is_null() {
                None
            } else {
                Some(Feature::from_c_feature(self.defn(), c_feature))
            }
        }
    }

    fn rewind(&mut self) {
        unsafe { gdal_sys::OGR_L_ResetReading(self.c_layer()) }
    }

    fn set_ignored_field_names(&mut self, names: &[String]) -> Result<(),GdalError> {
        let c_names = names.iter().map(|name| CString::new(name.as_str())).collect::<Result<Vec<_>,_>>()?;
        let mut c_pointers: Vec<*const c_char> = c_names.iter().map(|name| name.as_ptr()).collect();
        c_pointers.push(std::ptr::null());
        let rv = unsafe { gdal_sys::OGR_L_SetIgnoredFields(self.c_layer(), c_pointers.as_mut_ptr()) };
        if rv != OGRErr::OGRERR_NONE {
            return Err(GdalError::OgrError {
                err: rv,
                method_name: "OGR_L_SetIgnoredFields",
            });
        }
        Ok(())
    }

    fn add_geometry_field(&mut self, name: &str, geometry_type: OGRwkbGeometryType::Type, srs: Option<&SpatialRef>) -> Result<(),GdalError> {
        let c_name = CString::new(name)?;
        unsafe {
            let c_defn = gdal_sys::OGR_GFld_Create(c_name.as_ptr(), geometry_type);
            if let Some(srs) = srs {
                gdal_sys::OGR_GFld_SetSpatialRef(c_defn, srs.to_c_hsrs());
            }
            // CreateGeomField copies the definition, so it can be destroyed right after.
            let rv = gdal_sys::OGR_L_CreateGeomField(self.c_layer(), c_defn, 1);
            gdal_sys::OGR_GFld_Destroy(c_defn);
            if rv != OGRErr::OGRERR_NONE {
                return Err(GdalError::OgrError {
                    err: rv,
                    method_name: "OGR_L_CreateGeomField",
                });
            }
        }
        Ok(())
    }

}

pub(crate) trait FeatureFix {

    fn set_geometry_at(&self, index: usize, geometry: Geometry) -> Result<(),GdalError>;

}

impl FeatureFix for Feature<'_> {

    // set_geometry only ever writes the first geometry field.
    fn set_geometry_at(&self, index: usize, geometry: Geometry) -> Result<(),GdalError> {
        let rv = unsafe {
            let c_geometry = gdal_sys::OGR_G_Clone(geometry.c_geometry());
            gdal_sys::OGR_F_SetGeomFieldDirectly(self.c_feature(), index as c_int, c_geometry)
        };
        if rv != OGRErr::OGRERR_NONE {
            return Err(GdalError::OgrError {
                err: rv,
                method_name: "OGR_F_SetGeomFieldDirectly",
            });
        }
        Ok(())
    }

}

unsafe fn assign_z_recursive(handle: gdal_sys::OGRGeometryH, z: f64) {
    let children = gdal_sys::OGR_G_GetGeometryCount(handle);
    if children > 0 {
        for i in 0..children {
            assign_z_recursive(gdal_sys::OGR_G_GetGeometryRef(handle, i), z);
        }
    } else {
        // SetPoint promotes the geometry to three dimensions on its own.
        for i in 0..gdal_sys::OGR_G_GetPointCount(handle) {
            let x = gdal_sys::OGR_G_GetX(handle, i);
            let y = gdal_sys::OGR_G_GetY(handle, i);
            gdal_sys::OGR_G_SetPoint(handle, i, x, y, z);
        }
    }
}

unsafe fn transform_vertices_recursive(handle: gdal_sys::OGRGeometryH, transform: &mut dyn FnMut(&mut [f64], &mut [f64], &mut [f64]) -> bool) -> bool {
    let children = gdal_sys::OGR_G_GetGeometryCount(handle);
    if children > 0 {
        for i in 0..children {
            if !transform_vertices_recursive(gdal_sys::OGR_G_GetGeometryRef(handle, i), transform) {
                return false;
            }
        }
        return true;
    }
    let point_count = gdal_sys::OGR_G_GetPointCount(handle);
    if point_count == 0 {
        return true;
    }
    let dimension = gdal_sys::OGR_G_GetCoordinateDimension(handle);
    let mut x = Vec::with_capacity(point_count as usize);
    let mut y = Vec::with_capacity(point_count as usize);
    let mut z = Vec::with_capacity(point_count as usize);
    for i in 0..point_count {
        x.push(gdal_sys::OGR_G_GetX(handle, i));
        y.push(gdal_sys::OGR_G_GetY(handle, i));
        z.push(gdal_sys::OGR_G_GetZ(handle, i));
    }
    if !transform(&mut x, &mut y, &mut z) {
        return false;
    }
    for i in 0..point_count {
        if dimension >= 3 {
            gdal_sys::OGR_G_SetPoint(handle, i, x[i as usize], y[i as usize], z[i as usize]);
        } else {
            gdal_sys::OGR_G_SetPoint_2D(handle, i, x[i as usize], y[i as usize]);
        }
    }
    true
}

pub(crate) trait GeometryFix: Sized {

    fn segmentize_lines(&mut self, max_length: f64);

    fn assign_uniform_z(&mut self, z: f64);

    fn force_coordinate_dimension(&mut self, dimension: i32);

    fn forced_to_polygon(self) -> Self;

    fn forced_to_multi_polygon(self) -> Self;

    fn forced_to_multi_line_string(self) -> Self;

    fn transform_each_vertex(&mut self, transform: &mut dyn FnMut(&mut [f64], &mut [f64], &mut [f64]) -> bool) -> bool;

    fn transformed_with_options(&self, transform: Option<&CoordTransform>, options: &CslStringList) -> Option<Self>;

}

impl GeometryFix for Geometry {

    fn segmentize_lines(&mut self, max_length: f64) {
        unsafe { gdal_sys::OGR_G_Segmentize(self.c_geometry(), max_length) }
    }

    fn assign_uniform_z(&mut self, z: f64) {
        unsafe { assign_z_recursive(self.c_geometry(), z) }
    }

    fn force_coordinate_dimension(&mut self, dimension: i32) {
        unsafe { gdal_sys::OGR_G_SetCoordinateDimension(self.c_geometry(), dimension) }
    }

    // The OGR_G_ForceTo* functions take ownership of their argument, which the
    // crate's wrapper can't give up, so they operate on a clone here.
    fn forced_to_polygon(self) -> Self {
        unsafe {
            let forced = gdal_sys::OGR_G_ForceToPolygon(gdal_sys::OGR_G_Clone(self.c_geometry()));
            adopt_geometry(forced)
        }
    }

    fn forced_to_multi_polygon(self) -> Self {
        unsafe {
            let forced = gdal_sys::OGR_G_ForceToMultiPolygon(gdal_sys::OGR_G_Clone(self.c_geometry()));
            adopt_geometry(forced)
        }
    }

    fn forced_to_multi_line_string(self) -> Self {
        unsafe {
            let forced = gdal_sys::OGR_G_ForceToMultiLineString(gdal_sys::OGR_G_Clone(self.c_geometry()));
            adopt_geometry(forced)
        }
    }

    fn transform_each_vertex(&mut self, transform: &mut dyn FnMut(&mut [f64], &mut [f64], &mut [f64]) -> bool) -> bool {
        unsafe { transform_vertices_recursive(self.c_geometry(), transform) }
    }

    // OGRGeometryFactory::transformWithOptions, which is what understands the
    // WRAPDATELINE and DATELINEOFFSET options.
    fn transformed_with_options(&self, transform: Option<&CoordTransform>, options: &CslStringList) -> Option<Self> {
        unsafe {
            let c_transform = match transform {
                Some(transform) => transform.to_c_hct(),
                None => null_mut()
            };
            let transformer = gdal_sys::OGR_GeomTransformer_Create(c_transform, options.as_ptr());
            if transformer.is_null() {
                return None;
            }
            let transformed = gdal_sys::OGR_GeomTransformer_Transform(transformer, self.c_geometry());
            gdal_sys::OGR_GeomTransformer_Destroy(transformer);
            if transformed.is_null() {
                None
            } else {
                Some(adopt_geometry(transformed))
            }
        }
    }

}
