//! PDF 导出
//!
//! 使用 lopdf 直接生成 A4 文档：问题文、图形（可选），解答另起一页。
//!
//! 配置的 TrueType 字体以 Type0 / CIDFontType2（Identity-H）嵌入，
//! 文本按字形宽度折行，并附带 ToUnicode 映射以便复制文字。
//! 没有可用字体时退回 PDF 内置的 Helvetica，无法显示的字符替换为 `?`。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use tracing::{debug, info, warn};
use ttf_parser::{Face, GlyphId};

use crate::error::ExportError;

const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN: i64 = 72;
/// 版心宽度（pt）
const TEXT_WIDTH: i64 = PAGE_WIDTH - 2 * MARGIN;
const FONT_SIZE: i64 = 11;
const TITLE_SIZE: i64 = 16;
const LINE_HEIGHT: i64 = 15;
/// Helvetica 11pt 在版心宽度内大约能放下的字符数
const CHARS_PER_LINE: usize = 80;
const IMAGE_MAX_WIDTH: f64 = 400.0;
const IMAGE_MAX_HEIGHT: f64 = 300.0;
/// 每个 bfchar 块最多 100 项
const BFCHAR_CHUNK: usize = 100;

/// 导出内容
#[derive(Debug, Clone, Default)]
pub struct ExportDocument {
    pub content: String,
    pub solution: Option<String>,
    /// PNG 图片（base64）
    pub image_base64: Option<String>,
}

/// 导出使用的字体
#[derive(Debug, Clone)]
pub enum PdfFont {
    /// 嵌入的 TrueType 字体
    Embedded(EmbeddedFont),
    /// PDF 内置字体，只能显示 ASCII
    Helvetica,
}

/// 已校验过的 TrueType 字体数据
#[derive(Debug, Clone)]
pub struct EmbeddedFont {
    name: String,
    data: Vec<u8>,
}

impl EmbeddedFont {
    /// 解析字体数据，不是有效的 TrueType 时返回错误
    pub fn from_bytes(name: &str, data: Vec<u8>) -> Result<Self, ExportError> {
        Face::parse(&data, 0).map_err(|e| ExportError::Font(format!("{}: {}", name, e)))?;
        Ok(Self {
            name: pdf_font_name(name),
            data,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn face(&self) -> Result<Face<'_>, ExportError> {
        Face::parse(&self.data, 0).map_err(|e| ExportError::Font(e.to_string()))
    }
}

/// BaseFont 只保留字母、数字和连字符
fn pdf_font_name(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "EmbeddedFont".to_string()
    } else {
        cleaned
    }
}

/// 按顺序尝试字体路径，使用第一个可读且有效的字体
///
/// # 参数
/// - `paths`: 候选字体路径
///
/// # 返回
/// 嵌入字体；全部不可用时返回 `PdfFont::Helvetica`
pub async fn load_font(paths: &[PathBuf]) -> PdfFont {
    for path in paths {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                debug!("字体不可用 {}: {}", path.display(), e);
                continue;
            }
        };
        match EmbeddedFont::from_bytes(&path.to_string_lossy(), data) {
            Ok(font) => {
                info!("🔤 PDF 字体: {}", path.display());
                return PdfFont::Embedded(font);
            }
            Err(e) => warn!("⚠️  跳过无效字体: {}", e),
        }
    }
    warn!("⚠️  没有可用的 TrueType 字体，使用 Helvetica（非 ASCII 字符无法显示）");
    PdfFont::Helvetica
}

/// 解码后的 RGB 图片
struct RasterImage {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

fn decode_image(image_base64: &str) -> Result<RasterImage, ExportError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(image_base64.trim())
        .map_err(|e| ExportError::ImageDecode(e.to_string()))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| ExportError::ImageDecode(e.to_string()))?
        .to_rgb8();
    Ok(RasterImage {
        width: image.width(),
        height: image.height(),
        rgb: image.into_raw(),
    })
}

/// 把文本转换为 Helvetica 可以显示的字节并按字符数折行
fn wrap_lines(text: &str) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    for raw in text.lines() {
        let bytes: Vec<u8> = raw
            .chars()
            .map(|c| if c.is_ascii() && !c.is_ascii_control() { c as u8 } else { b'?' })
            .collect();
        if bytes.is_empty() {
            lines.push(Vec::new());
            continue;
        }
        lines.extend(bytes.chunks(CHARS_PER_LINE).map(<[u8]>::to_vec));
    }
    lines
}

/// 一个已使用的字形
struct UsedGlyph {
    /// 千分之一 em 的宽度
    width: i64,
    text: char,
}

/// 把文本转换为 Tj 操作数
enum Typesetter<'a> {
    Embedded {
        face: Face<'a>,
        units_per_em: i64,
        used: BTreeMap<u16, UsedGlyph>,
    },
    Helvetica,
}

impl<'a> Typesetter<'a> {
    fn new(font: &'a PdfFont) -> Result<Self, ExportError> {
        match font {
            PdfFont::Embedded(font) => {
                let face = font.face()?;
                let units_per_em = i64::from(face.units_per_em().max(1));
                Ok(Typesetter::Embedded {
                    face,
                    units_per_em,
                    used: BTreeMap::new(),
                })
            }
            PdfFont::Helvetica => Ok(Typesetter::Helvetica),
        }
    }

    /// 字体能显示全部字符时用 `preferred`，否则用 ASCII 的 `fallback`
    fn label<'s>(&self, preferred: &'s str, fallback: &'s str) -> &'s str {
        match self {
            Typesetter::Embedded { face, .. }
                if preferred.chars().all(|c| face.glyph_index(c).is_some()) =>
            {
                preferred
            }
            _ => fallback,
        }
    }

    /// 折行并编码，每一项是一行的 Tj 操作数
    fn wrap(&mut self, text: &str, size: i64) -> Vec<Object> {
        match self {
            Typesetter::Helvetica => wrap_lines(text)
                .into_iter()
                .map(|line| Object::String(line, StringFormat::Literal))
                .collect(),
            Typesetter::Embedded {
                face,
                units_per_em,
                used,
            } => {
                let limit = TEXT_WIDTH * 1000;
                let mut lines = Vec::new();
                for raw in text.lines() {
                    let mut line = Vec::new();
                    let mut line_width = 0;
                    for c in raw.chars() {
                        let c = if c == '\t' { ' ' } else { c };
                        if c.is_control() {
                            continue;
                        }
                        let glyph = face.glyph_index(c).unwrap_or(GlyphId(0));
                        let advance = i64::from(face.glyph_hor_advance(glyph).unwrap_or(0));
                        let width = advance * 1000 / *units_per_em;
                        if !line.is_empty() && line_width + width * size > limit {
                            let full = std::mem::take(&mut line);
                            lines.push(Object::String(full, StringFormat::Hexadecimal));
                            line_width = 0;
                        }
                        line.extend_from_slice(&glyph.0.to_be_bytes());
                        line_width += width * size;
                        used.entry(glyph.0).or_insert(UsedGlyph { width, text: c });
                    }
                    lines.push(Object::String(line, StringFormat::Hexadecimal));
                }
                lines
            }
        }
    }
}

/// 逐页收集绘制指令
struct PageWriter {
    pages: Vec<Vec<Operation>>,
    cursor_y: i64,
}

impl PageWriter {
    fn new() -> Self {
        Self {
            pages: vec![Vec::new()],
            cursor_y: PAGE_HEIGHT - MARGIN,
        }
    }

    fn new_page(&mut self) {
        self.pages.push(Vec::new());
        self.cursor_y = PAGE_HEIGHT - MARGIN;
    }

    fn ensure_space(&mut self, height: i64) {
        if self.cursor_y - height < MARGIN {
            self.new_page();
        }
    }

    fn ops(&mut self) -> &mut Vec<Operation> {
        // pages 至少有一页
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    fn text_line(&mut self, operand: Object, size: i64, line_height: i64) {
        self.ensure_space(line_height);
        self.cursor_y -= line_height;
        let y = self.cursor_y;
        self.ops().extend([
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), size.into()]),
            Operation::new("Td", vec![MARGIN.into(), y.into()]),
            Operation::new("Tj", vec![operand]),
            Operation::new("ET", vec![]),
        ]);
    }

    fn title(&mut self, typesetter: &mut Typesetter<'_>, preferred: &str, fallback: &str) {
        let label = typesetter.label(preferred, fallback);
        for line in typesetter.wrap(label, TITLE_SIZE) {
            self.text_line(line, TITLE_SIZE, TITLE_SIZE + 10);
        }
        self.cursor_y -= 6;
    }

    fn paragraph(&mut self, typesetter: &mut Typesetter<'_>, text: &str) {
        for line in typesetter.wrap(text, FONT_SIZE) {
            self.text_line(line, FONT_SIZE, LINE_HEIGHT);
        }
    }

    fn image(&mut self, name: &str, width: u32, height: u32) {
        let scale = (IMAGE_MAX_WIDTH / f64::from(width))
            .min(IMAGE_MAX_HEIGHT / f64::from(height))
            .min(1.0);
        let w = (f64::from(width) * scale).round() as i64;
        let h = (f64::from(height) * scale).round() as i64;

        self.ensure_space(h + LINE_HEIGHT);
        self.cursor_y -= h + LINE_HEIGHT / 2;
        let x = (PAGE_WIDTH - w) / 2;
        let y = self.cursor_y;
        self.ops().extend([
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![w.into(), 0.into(), 0.into(), h.into(), x.into(), y.into()],
            ),
            Operation::new("Do", vec![Object::Name(name.as_bytes().to_vec())]),
            Operation::new("Q", vec![]),
        ]);
    }
}

/// 字形 ID 到 Unicode 的 CMap
fn to_unicode_cmap(used: &BTreeMap<u16, UsedGlyph>) -> Vec<u8> {
    let mut cmap = String::from(
        "/CIDInit /ProcSet findresource begin\n12 dict begin\nbegincmap\n\
         /CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n\
         /CMapName /Adobe-Identity-UCS def\n/CMapType 2 def\n\
         1 begincodespacerange\n<0000> <FFFF>\nendcodespacerange\n",
    );
    let entries: Vec<_> = used.iter().filter(|(gid, _)| **gid != 0).collect();
    for chunk in entries.chunks(BFCHAR_CHUNK) {
        cmap.push_str(&format!("{} beginbfchar\n", chunk.len()));
        for (gid, glyph) in chunk {
            let mut units = [0u16; 2];
            let utf16: String = glyph
                .text
                .encode_utf16(&mut units)
                .iter()
                .map(|u| format!("{:04X}", u))
                .collect();
            cmap.push_str(&format!("<{:04X}> <{}>\n", gid, utf16));
        }
        cmap.push_str("endbfchar\n");
    }
    cmap.push_str("endcmap\nCMapName currentdict /CMapResource defineresource pop\nend\nend\n");
    cmap.into_bytes()
}

/// 写入嵌入字体的全部对象，返回 Type0 字体的对象 ID
fn add_embedded_font(
    doc: &mut Document,
    font: &EmbeddedFont,
    face: &Face<'_>,
    used: &BTreeMap<u16, UsedGlyph>,
) -> ObjectId {
    let units_per_em = i64::from(face.units_per_em().max(1));
    let scale = |v: i16| i64::from(v) * 1000 / units_per_em;
    let bbox = face.global_bounding_box();
    let ascent = scale(face.ascender());

    let font_file_id = doc.add_object(Stream::new(
        dictionary! { "Length1" => font.data.len() as i64 },
        font.data.clone(),
    ));
    let descriptor_id = doc.add_object(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => font.name(),
        "Flags" => 4,
        "FontBBox" => vec![
            scale(bbox.x_min).into(),
            scale(bbox.y_min).into(),
            scale(bbox.x_max).into(),
            scale(bbox.y_max).into(),
        ],
        "ItalicAngle" => 0,
        "Ascent" => ascent,
        "Descent" => scale(face.descender()),
        "CapHeight" => face.capital_height().map(scale).unwrap_or(ascent),
        "StemV" => 80,
        "FontFile2" => font_file_id,
    });

    let mut widths: Vec<Object> = Vec::with_capacity(used.len() * 2);
    for (gid, glyph) in used {
        widths.push(i64::from(*gid).into());
        widths.push(vec![Object::from(glyph.width)].into());
    }
    let cid_font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType2",
        "BaseFont" => font.name(),
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("Identity"),
            "Supplement" => 0,
        },
        "FontDescriptor" => descriptor_id,
        "CIDToGIDMap" => "Identity",
        "DW" => 1000,
        "W" => widths,
    });
    let to_unicode_id = doc.add_object(Stream::new(dictionary! {}, to_unicode_cmap(used)));

    doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => font.name(),
        "Encoding" => "Identity-H",
        "DescendantFonts" => vec![Object::from(cid_font_id)],
        "ToUnicode" => to_unicode_id,
    })
}

/// 生成 PDF
///
/// 图片无法解码时记录警告并跳过图片，其余内容照常导出。
///
/// # 参数
/// - `document`: 问题文、解答和图片
/// - `font`: 正文字体
///
/// # 返回
/// PDF 文件的字节
pub fn export_problem_pdf(
    document: &ExportDocument,
    font: &PdfFont,
) -> Result<Vec<u8>, ExportError> {
    let image = document
        .image_base64
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .and_then(|image_base64| match decode_image(image_base64) {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("⚠️  跳过无法解码的图片: {}", e);
                None
            }
        });

    let mut typesetter = Typesetter::new(font)?;
    let mut writer = PageWriter::new();
    writer.title(&mut typesetter, "問題", "Problem");
    writer.paragraph(&mut typesetter, &document.content);
    if let Some(image) = &image {
        writer.image("Im1", image.width, image.height);
    }
    if let Some(solution) = document.solution.as_deref().filter(|s| !s.trim().is_empty()) {
        writer.new_page();
        writer.title(&mut typesetter, "解答・解説", "Solution");
        writer.paragraph(&mut typesetter, solution);
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = match (&typesetter, font) {
        (Typesetter::Embedded { face, used, .. }, PdfFont::Embedded(embedded)) => {
            add_embedded_font(&mut doc, embedded, face, used)
        }
        _ => doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        }),
    };

    let mut resources = Dictionary::new();
    resources.set("Font", dictionary! { "F1" => font_id });
    if let Some(image) = image {
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => i64::from(image.width),
                "Height" => i64::from(image.height),
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            image.rgb,
        ));
        resources.set("XObject", dictionary! { "Im1" => image_id });
    }
    let resources_id = doc.add_object(resources);

    let mut kids: Vec<Object> = Vec::with_capacity(writer.pages.len());
    for operations in writer.pages {
        let content = Content { operations };
        let encoded = content.encode().map_err(|e| ExportError::Pdf(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id: ObjectId = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let page_count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| ExportError::Pdf(e.to_string()))?;
    debug!("PDF 生成完成: {} 页, {} 字节", page_count, bytes.len());
    Ok(bytes)
}
