//! Geometry value types.
//!
//! Geometry columns arrive as WKB preceded by a 4-byte SRID; the driver's
//! geometry codec parses that encoding into these types.

/// A geometry value with its spatial reference id.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub srid: u32,
    pub shape: Shape,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Point(Point),
    LineString(LineString),
    Polygon(Polygon),
    MultiPoint(Vec<Point>),
    MultiLineString(Vec<LineString>),
    MultiPolygon(Vec<Polygon>),
    GeometryCollection(Vec<Shape>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An ordered run of points.
#[derive(Debug, Clone, PartialEq)]
pub struct LineString {
    pub points: Vec<Point>,
}

/// An exterior ring followed by interior rings; each ring is closed.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub rings: Vec<LineString>,
}

impl Shape {
    /// WKB geometry type tag for this shape.
    pub fn wkb_type(&self) -> u32 {
        match self {
            Shape::Point(_) => 1,
            Shape::LineString(_) => 2,
            Shape::Polygon(_) => 3,
            Shape::MultiPoint(_) => 4,
            Shape::MultiLineString(_) => 5,
            Shape::MultiPolygon(_) => 6,
            Shape::GeometryCollection(_) => 7,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Shape::Point(_) => "POINT",
            Shape::LineString(_) => "LINESTRING",
            Shape::Polygon(_) => "POLYGON",
            Shape::MultiPoint(_) => "MULTIPOINT",
            Shape::MultiLineString(_) => "MULTILINESTRING",
            Shape::MultiPolygon(_) => "MULTIPOLYGON",
            Shape::GeometryCollection(_) => "GEOMETRYCOLLECTION",
        }
    }
}
