/// 终端状态行 (Terminal status line)
///
/// 每次更新以 `\r` 开头原地覆盖; 新文本比上一条短时先写 `ESC[2K` 清行。
use std::io::{self, Write};

pub const CLEAR_LINE: &str = "\x1b[2K";

pub struct StatusLine<W: Write> {
    out: W,
    previous_len: usize,
}

impl StatusLine<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> StatusLine<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            previous_len: 0,
        }
    }

    pub fn update(&mut self, text: &str) -> io::Result<()> {
        let len = text.chars().count();
        if len < self.previous_len {
            self.out.write_all(CLEAR_LINE.as_bytes())?;
        }
        self.out.write_all(b"\r")?;
        self.out.write_all(text.as_bytes())?;
        self.out.flush()?;
        self.previous_len = len;
        Ok(())
    }

    /// 结束状态行, 换行后下一条输出不会覆盖它
    pub fn finish(&mut self) -> io::Result<()> {
        if self.previous_len > 0 {
            self.out.write_all(b"\n")?;
            self.out.flush()?;
            self.previous_len = 0;
        }
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(status: &StatusLine<Vec<u8>>) -> String {
        String::from_utf8(status.get_ref().clone()).unwrap()
    }

    #[test]
    fn test_shorter_text_clears_line() {
        let mut status = StatusLine::new(Vec::new());
        status.update("12.34% - plastic").unwrap();
        status.update("no match").unwrap();
        assert_eq!(written(&status), "\r12.34% - plastic\x1b[2K\rno match");
    }

    #[test]
    fn test_longer_text_does_not_clear() {
        let mut status = StatusLine::new(Vec::new());
        status.update("no match").unwrap();
        status.update("98.76% - plastic").unwrap();
        assert_eq!(written(&status), "\rno match\r98.76% - plastic");
    }

    #[test]
    fn test_equal_length_does_not_clear() {
        let mut status = StatusLine::new(Vec::new());
        status.update("abc").unwrap();
        status.update("xyz").unwrap();
        assert!(!written(&status).contains(CLEAR_LINE));
    }

    #[test]
    fn test_finish_emits_newline_once() {
        let mut status = StatusLine::new(Vec::new());
        status.finish().unwrap();
        status.update("x").unwrap();
        status.finish().unwrap();
        status.finish().unwrap();
        assert_eq!(written(&status), "\rx\n");
    }
}
