use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/** \brief 当前帧协议版本。 */
pub const FRAME_VERSION: u8 = 1;

/**
 * \brief 中继与客户端之间的流式帧体。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameBody {
    /** \brief 一段增量文本。 */
    Delta { content: String },
    /** \brief 提供商或中继侧的失败，流随即结束。 */
    Error { message: String },
    /** \brief 正常结束标记。 */
    Done,
}

/**
 * \brief 换行分隔的 JSON 帧。中继逐帧写出，客户端逐帧重组，
 *        与底层字节分块方式无关。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /** \brief 协议版本，当前为 1。 */
    pub v: u8,
    #[serde(flatten)]
    pub body: FrameBody,
}

impl Frame {
    pub fn delta(content: impl Into<String>) -> Self {
        Frame {
            v: FRAME_VERSION,
            body: FrameBody::Delta {
                content: content.into(),
            },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame {
            v: FRAME_VERSION,
            body: FrameBody::Error {
                message: message.into(),
            },
        }
    }

    pub fn done() -> Self {
        Frame {
            v: FRAME_VERSION,
            body: FrameBody::Done,
        }
    }

    /** \brief 编码为一行 NDJSON，含末尾换行。 */
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/**
 * \brief 客户端侧的增量帧重组器。
 * \details 只在完整行边界上解码；跨块的半行与被拆开的多字节字符都留在
 *          缓冲区中等待后续字节，空行跳过。
 */
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        FrameAssembler::default()
    }

    /**
     * \brief 喂入一段字节，返回其中包含的完整帧。
     */
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = std::str::from_utf8(&line[..line.len() - 1])?.trim();
            if text.is_empty() {
                continue;
            }
            let frame: Frame = serde_json::from_str(text)?;
            if frame.v != FRAME_VERSION {
                bail!("unsupported frame version: {}", frame.v);
            }
            frames.push(frame);
        }
        Ok(frames)
    }

    /** \brief 缓冲区中是否还留有未完结的半行。 */
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(frames: &[Frame]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for frame in frames {
            bytes.extend_from_slice(frame.encode().expect("encode frame").as_bytes());
        }
        bytes
    }

    #[test]
    fn test_frame_wire_shape() {
        let line = Frame::delta("你好").encode().expect("encode");
        assert_eq!(line, "{\"v\":1,\"type\":\"delta\",\"content\":\"你好\"}\n");
        let done = Frame::done().encode().expect("encode done");
        assert_eq!(done, "{\"v\":1,\"type\":\"done\"}\n");
    }

    #[test]
    fn test_assembly_is_chunk_boundary_independent() {
        let frames = vec![
            Frame::delta("Hello, "),
            Frame::delta("世界！"),
            Frame::delta("streaming"),
            Frame::done(),
        ];
        let bytes = encode_all(&frames);

        for chunk_size in [1, 2, 3, 5, 7, 16, bytes.len()] {
            let mut assembler = FrameAssembler::new();
            let mut collected = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                collected.extend(assembler.push(chunk).expect("push chunk"));
            }
            assert_eq!(collected, frames, "chunk_size={}", chunk_size);
            assert!(!assembler.has_partial());
        }
    }

    #[test]
    fn test_partial_line_stays_buffered() {
        let line = Frame::delta("tail").encode().expect("encode");
        let (head, rest) = line.as_bytes().split_at(line.len() / 2);

        let mut assembler = FrameAssembler::new();
        assert!(assembler.push(head).expect("push head").is_empty());
        assert!(assembler.has_partial());
        let frames = assembler.push(rest).expect("push rest");
        assert_eq!(frames, vec![Frame::delta("tail")]);
    }

    #[test]
    fn test_empty_lines_are_skipped() {
        let mut assembler = FrameAssembler::new();
        let mut bytes = b"\n\n".to_vec();
        bytes.extend_from_slice(Frame::done().encode().expect("encode").as_bytes());
        let frames = assembler.push(&bytes).expect("push");
        assert_eq!(frames, vec![Frame::done()]);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut assembler = FrameAssembler::new();
        let err = assembler
            .push(b"{\"v\":2,\"type\":\"done\"}\n")
            .expect_err("version 2 must fail");
        assert!(err.to_string().contains("unsupported frame version"));
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.push(b"not json\n").is_err());
    }
}
