use std::fmt::Write;
use std::path::PathBuf;

use base64::Engine;
use chrono::{DateTime, Datelike, Local, Timelike};

use crate::remote::RemoteItem;
use crate::types::SizeVariant;
use crate::unicode::nfc;

/// Expand date tokens (%Y, %m, %d, %H, %M, %S) in a single pass. Unknown
/// tokens keep their `%`.
pub fn expand_date_format(format_str: &str, date: &DateTime<Local>) -> String {
    let mut result = String::with_capacity(format_str.len() + 8);
    let mut chars = format_str.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            result.push(c);
            continue;
        }
        let _ = match chars.peek() {
            Some('Y') => write!(result, "{:04}", date.year()),
            Some('m') => write!(result, "{:02}", date.month()),
            Some('d') => write!(result, "{:02}", date.day()),
            Some('H') => write!(result, "{:02}", date.hour()),
            Some('M') => write!(result, "{:02}", date.minute()),
            Some('S') => write!(result, "{:02}", date.second()),
            _ => {
                result.push(c);
                continue;
            }
        };
        chars.next();
    }

    result
}

/// Relative folder for a photo taken at `created`, e.g. `2024/03` for
/// `%Y/%m`. Empty and dot-only segments are dropped.
pub fn date_folder(folder_format: &str, created: &DateTime<Local>) -> PathBuf {
    expand_date_format(folder_format, created)
        .split('/')
        .map(clean_filename)
        .filter(|c| !c.is_empty())
        .collect()
}

/// Strip characters that are invalid on common filesystems and refuse the
/// special names `.` and `..`.
pub fn clean_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0'))
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

/// Extensions for `original_alt` renditions, keyed by uniform type identifier.
const ORIGINAL_ALT_EXTENSIONS: &[(&str, &str)] = &[
    ("public.png", "png"),
    ("public.jpeg", "jpeg"),
    ("public.heic", "heic"),
    ("public.heif", "heif"),
    ("public.image", "HEIC"),
    ("public.tiff", "tiff"),
    ("public.jpeg-2000", "jp2"),
    ("public.pbm", "pbm"),
    ("public.mpo-image", "mpo"),
    ("public.avif", "avif"),
    ("org.webmproject.webp", "webp"),
    ("com.compuserve.gif", "gif"),
    ("com.microsoft.bmp", "bmp"),
    ("com.truevision.tga-image", "tga"),
    ("com.sgi.sgi-image", "sgi"),
    ("com.adobe.photoshop-image", "psd"),
    ("com.adobe.pdf", "pdf"),
    ("com.adobe.raw-image", "dng"),
    ("com.sony.arw-raw-image", "arw"),
    ("com.fuji.raw-image", "raf"),
    ("com.canon.cr2-raw-image", "cr2"),
    ("com.canon.cr3-raw-image", "cr3"),
    ("com.canon.crw-raw-image", "crw"),
    ("com.panasonic.rw2-raw-image", "rw2"),
    ("com.nikon.nrw-raw-image", "nrw"),
    ("com.nikon.raw-image", "nef"),
    ("com.pentax.raw-image", "pef"),
    ("com.olympus.raw-image", "orf"),
    ("com.olympus.or-raw-image", "orf"),
    ("com.dji.mimo.pano.jpeg", "jpg"),
];

pub fn original_alt_extension(uti: &str) -> Option<&'static str> {
    ORIGINAL_ALT_EXTENSIONS
        .iter()
        .find(|(t, _)| *t == uti)
        .map(|(_, ext)| *ext)
}

/// Split `name` at its last dot. Names without a dot have no extension.
fn split_name(name: &str) -> (&str, &str) {
    name.rsplit_once('.').unwrap_or((name, ""))
}

fn stem_and_extension(item: &RemoteItem, variant: SizeVariant) -> (String, String) {
    let name = nfc(&clean_filename(&item.name));
    let (stem, ext) = split_name(&name);
    let mut ext = ext.to_string();
    if variant == SizeVariant::OriginalAlt {
        let uti = item
            .versions
            .get(&variant)
            .and_then(|v| v.file_type.as_deref());
        match uti.map(|t| (t, original_alt_extension(t))) {
            Some((_, Some(mapped))) => ext = mapped.to_string(),
            Some((t, None)) => tracing::warn!(
                file_type = t,
                name = %item.name,
                "Unknown file type for original_alt rendition, keeping extension"
            ),
            None => {}
        }
    }
    (stem.to_string(), ext)
}

fn with_extension(base: String, ext: &str) -> String {
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}

/// `<stem>__<variant>__<base64url(id)>.<ext>`. The encoded id keeps two
/// photos with the same file name apart.
pub fn photo_filename(item: &RemoteItem, variant: SizeVariant) -> String {
    let (stem, ext) = stem_and_extension(item, variant);
    let id = base64::engine::general_purpose::URL_SAFE.encode(item.id.as_bytes());
    with_extension(format!("{stem}__{}__{id}", variant.as_str()), &ext)
}

/// The older `<stem>__<variant>.<ext>` naming, renamed on sight.
pub fn legacy_photo_filename(item: &RemoteItem, variant: SizeVariant) -> String {
    let (stem, ext) = stem_and_extension(item, variant);
    with_extension(format!("{stem}__{}", variant.as_str()), &ext)
}
