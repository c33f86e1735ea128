//! Small synthetic media payloads. The analyzers under test never decode
//! them, so only the leading magic bytes are realistic.

pub struct MediaFixture {
    pub filename: &'static str,
    pub content_type: &'static str,
    pub bytes: &'static [u8],
    pub description: &'static str,
}

pub const MEAL_VIDEO: MediaFixture = MediaFixture {
    filename: "meal.mp4",
    content_type: "video/mp4",
    bytes: b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00mp42isom\x00\x00\x00\x08free",
    description: "MP4 container header",
};

pub const PLATE_PHOTO: MediaFixture = MediaFixture {
    filename: "plate.png",
    content_type: "image/png",
    bytes: b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00\x00\x01\x00\x00\x00\x01\x08\x02",
    description: "PNG signature and IHDR chunk",
};

pub const ARCHIVE: MediaFixture = MediaFixture {
    filename: "meals.zip",
    content_type: "application/zip",
    bytes: b"PK\x03\x04",
    description: "ZIP local file header, not an accepted media type",
};

pub const ALL_MEDIA: &[MediaFixture] = &[MEAL_VIDEO, PLATE_PHOTO];
