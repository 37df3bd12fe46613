// 音频处理模块
//
// 子模块：
// - separator: 人声分离引擎接口及 audio-separator 实现

pub mod separator;

#[cfg(test)]
pub mod fake;
