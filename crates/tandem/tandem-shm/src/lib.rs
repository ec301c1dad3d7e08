mod segment;

pub use segment::SharedSegment;
