use anyhow::{anyhow, Context, Result};
use imageproc::point::Point;
use std::fs;
use std::path::{Path, PathBuf};

/// Transcription marking a region that is excluded from supervision.
pub const IGNORE_TEXT: &str = "###";
const POLYGON_VALUES: usize = 8;
const BOM: char = '\u{feff}';

#[derive(Debug, Clone, PartialEq)]
pub struct TextLine {
    pub poly: Vec<Point<f64>>,
    pub text: String,
}

impl TextLine {
    pub fn is_ignored(&self) -> bool {
        self.text == IGNORE_TEXT
    }
}

fn read_file(file_path: &Path) -> Result<String> {
    if !file_path.is_file() {
        return Err(anyhow!("File {} doesn't exist", file_path.display()));
    }
    fs::read_to_string(file_path).with_context(|| format!("reading {}", file_path.display()))
}

/// Reads an index file made of `image_path<TAB>annotation_path` rows.
pub fn read_idx_file<P: AsRef<Path>>(idx_fp: P) -> Result<Vec<(PathBuf, PathBuf)>> {
    let idx_fp = idx_fp.as_ref();
    let content = read_file(idx_fp)?;
    content
        .lines()
        .enumerate()
        .map(|(n, line)| (n, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(n, line)| match line.split('\t').collect::<Vec<&str>>().as_slice() {
            [img_fp, gt_fp] => Ok((PathBuf::from(img_fp.trim()), PathBuf::from(gt_fp.trim()))),
            _ => Err(anyhow!(
                "{}:{}: expected 'image_path<TAB>annotation_path', got '{}'",
                idx_fp.display(),
                n + 1,
                line
            )),
        })
        .collect()
}

fn parse_annotation_line(line: &str) -> Result<TextLine> {
    // row is in format
    // x1,y1,x2,y2,x3,y3,x4,y4,{TRANSCRIPTION}
    // where the transcription itself may contain commas
    let parts = line.split(',').collect::<Vec<&str>>();
    if parts.len() <= POLYGON_VALUES {
        return Err(anyhow!(
            "expected {} coordinates followed by a transcription, got {} fields",
            POLYGON_VALUES,
            parts.len()
        ));
    }
    let values = parts[..POLYGON_VALUES]
        .iter()
        .map(|v| {
            let v = v.trim().trim_matches(BOM);
            v.parse::<f64>()
                .map_err(|_| anyhow!("invalid coordinate '{}'", v))
        })
        .collect::<Result<Vec<f64>>>()?;
    let poly = values
        .chunks(2)
        .map(|xy| Point::new(xy[0], xy[1]))
        .collect();
    let text = parts[POLYGON_VALUES..]
        .join(",")
        .trim()
        .trim_matches(BOM)
        .to_string();

    Ok(TextLine { poly, text })
}

pub fn load_annotation<P: AsRef<Path>>(gt_fp: P) -> Result<Vec<TextLine>> {
    let gt_fp = gt_fp.as_ref();
    let content = read_file(gt_fp)?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().trim_matches(BOM).is_empty())
        .map(|(n, line)| {
            parse_annotation_line(line.trim())
                .with_context(|| format!("{}:{}", gt_fp.display(), n + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(content: &str) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(content.as_bytes())?;
        Ok(file)
    }

    #[test]
    fn parse_annotation_line_test() -> Result<()> {
        let line = parse_annotation_line("377,117,463,117,465,130,378,130,Genaxis Theatre")?;
        assert_eq!(
            line.poly,
            vec![
                Point::new(377., 117.),
                Point::new(463., 117.),
                Point::new(465., 130.),
                Point::new(378., 130.),
            ]
        );
        assert_eq!(line.text, "Genaxis Theatre");
        assert!(!line.is_ignored());
        Ok(())
    }

    #[test]
    fn parse_annotation_line_with_bom_and_commas() -> Result<()> {
        let line = parse_annotation_line("\u{feff}1.5, 2,10,2,10,8,1.5,8,hello, world")?;
        assert_eq!(line.poly[0], Point::new(1.5, 2.));
        assert_eq!(line.text, "hello, world");
        Ok(())
    }

    #[test]
    fn ignore_sentinel_test() -> Result<()> {
        let line = parse_annotation_line("0,0,10,0,10,10,0,10,###")?;
        assert!(line.is_ignored());
        Ok(())
    }

    #[test]
    fn invalid_annotation_lines() {
        assert!(parse_annotation_line("0,0,10,0,10,10,0,10").is_err());
        assert!(parse_annotation_line("0,0,10,zero,10,10,0,10,text").is_err());
    }

    #[test]
    fn load_annotation_test() -> Result<()> {
        let file = temp_file("0,0,10,0,10,10,0,10,abc\n\n20,20,40,20,40,30,20,30,###\n")?;
        let lines = load_annotation(file.path())?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "abc");
        assert!(lines[1].is_ignored());
        Ok(())
    }

    #[test]
    fn load_annotation_reports_line_number() -> Result<()> {
        let file = temp_file("0,0,10,0,10,10,0,10,abc\n0,0,broken\n")?;
        let err = load_annotation(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains(":2"));
        Ok(())
    }

    #[test]
    fn read_idx_file_test() -> Result<()> {
        let file = temp_file("images/a.jpg\tgts/a.txt\n\nimages/b.jpg\tgts/b.txt\n")?;
        let pairs = read_idx_file(file.path())?;
        assert_eq!(
            pairs,
            vec![
                (PathBuf::from("images/a.jpg"), PathBuf::from("gts/a.txt")),
                (PathBuf::from("images/b.jpg"), PathBuf::from("gts/b.txt")),
            ]
        );
        Ok(())
    }

    #[test]
    fn read_idx_file_rejects_malformed_rows() -> Result<()> {
        let file = temp_file("images/a.jpg gts/a.txt\n")?;
        assert!(read_idx_file(file.path()).is_err());
        Ok(())
    }

    #[test]
    fn missing_files_fail() {
        assert!(read_idx_file("does/not/exist.tsv").is_err());
        assert!(load_annotation("does/not/exist.txt").is_err());
    }
}
