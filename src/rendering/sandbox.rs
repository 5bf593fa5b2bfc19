//! 子进程渲染
//!
//! 固定的驱动脚本通过 `-c` 传给解释器，绘图代码从 stdin 读入。
//! 驱动脚本先导入绘图模块，再收紧资源上限（地址空间、CPU 时间、
//! 文件写入、子进程），最后用白名单内置函数执行绘图代码，
//! 把当前图形保存为 PNG 并以 base64 打印到 stdout。
//!
//! 双下划线名称在进入子进程前就被拒绝，`__import__`、`__class__`
//! 之类的逃逸写法不会被执行。超时覆盖写入与等待，超时后子进程被杀掉。

use std::process::{Output, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{FigureRenderer, RenderContext, RenderOutcome};
use crate::error::RenderError;
use crate::services::extraction::strip_import_statements;

/// 驱动脚本，参数依次为地址空间上限（字节）和 CPU 秒数
pub const DRIVER: &str = r#"
import base64, io, math, resource, sys
import matplotlib
matplotlib.use('Agg')
import matplotlib.pyplot as plt
import matplotlib.patches as patches
import numpy as np
from mpl_toolkits.mplot3d import Axes3D
from mpl_toolkits.mplot3d.art3d import Poly3DCollection

code = sys.stdin.read()
memory, cpu = int(sys.argv[1]), int(sys.argv[2])
resource.setrlimit(resource.RLIMIT_AS, (memory, memory))
resource.setrlimit(resource.RLIMIT_CPU, (cpu, cpu))
resource.setrlimit(resource.RLIMIT_FSIZE, (0, 0))
try:
    resource.setrlimit(resource.RLIMIT_NPROC, (0, 0))
except (ValueError, OSError):
    pass

import builtins
ALLOWED = (
    'abs', 'all', 'any', 'bool', 'dict', 'divmod', 'enumerate', 'filter', 'float',
    'int', 'isinstance', 'len', 'list', 'map', 'max', 'min', 'pow', 'print', 'range',
    'reversed', 'round', 'set', 'slice', 'sorted', 'str', 'sum', 'tuple', 'zip',
    'Exception', 'ValueError', 'ZeroDivisionError',
)
scope = {
    '__builtins__': {name: getattr(builtins, name) for name in ALLOWED},
    '__name__': '__main__',
    'plt': plt, 'patches': patches, 'np': np, 'math': math,
    'Axes3D': Axes3D, 'Poly3DCollection': Poly3DCollection,
}

out = sys.stdout
sys.stdout = sys.stderr
exec(compile(code, '<figure>', 'exec'), scope)

buf = io.BytesIO()
plt.savefig(buf, format='png', dpi=150, bbox_inches='tight')
plt.close('all')
out.write(base64.b64encode(buf.getvalue()).decode())
"#;

/// 双下划线名称，`__name__` 除外
static DUNDER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"__\w*").ok());

/// 子进程渲染器
#[derive(Debug, Clone)]
pub struct SandboxRenderer {
    command: String,
    timeout: Duration,
    memory_mb: u64,
}

impl SandboxRenderer {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            memory_mb: 512,
        }
    }

    /// 设置子进程的地址空间上限
    pub fn with_memory_limit(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// 去掉 import 行并拒绝双下划线名称
    ///
    /// # 返回
    /// 可以交给驱动脚本执行的代码
    pub fn prepare_code(code: &str) -> Result<String, RenderError> {
        let code = strip_import_statements(code);
        if let Some(dunder) = DUNDER.as_ref() {
            if let Some(found) = dunder
                .find_iter(&code)
                .map(|m| m.as_str())
                .find(|name| *name != "__name__" && *name != "__main__")
            {
                return Err(RenderError::ForbiddenName(found.to_string()));
            }
        }
        Ok(code)
    }

    async fn run(&self, code: &str) -> Result<String, RenderError> {
        let code = Self::prepare_code(code)?;
        let memory_bytes = self.memory_mb.saturating_mul(1024 * 1024);
        let cpu_secs = self.timeout.as_secs().max(1);

        let child = Command::new(&self.command)
            .arg("-I")
            .arg("-c")
            .arg(DRIVER)
            .arg(memory_bytes.to_string())
            .arg(cpu_secs.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RenderError::SandboxFailed(format!("无法启动 {}: {}", self.command, e))
            })?;

        let output = exchange(child, code, self.timeout).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().last().unwrap_or("").to_string();
            return Err(RenderError::SandboxFailed(format!(
                "退出码 {:?}: {}",
                output.status.code(),
                last_line
            )));
        }

        let image = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if image.is_empty() {
            return Err(RenderError::SandboxFailed("没有输出图片".to_string()));
        }
        Ok(image)
    }
}

/// 写入代码并等待子进程结束，两者都受同一个超时约束
///
/// 超时后 future 被丢弃，`kill_on_drop` 会杀掉子进程。
async fn exchange(
    mut child: Child,
    input: String,
    timeout: Duration,
) -> Result<Output, RenderError> {
    let stdin = child.stdin.take();
    let run = async move {
        if let Some(mut stdin) = stdin {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| RenderError::SandboxFailed(format!("写入代码失败: {}", e)))?;
            // 关闭 stdin，驱动脚本才能读到结尾
            drop(stdin);
        }
        child
            .wait_with_output()
            .await
            .map_err(|e| RenderError::SandboxFailed(e.to_string()))
    };

    tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| RenderError::Timeout(timeout.as_secs()))?
}

#[async_trait]
impl FigureRenderer for SandboxRenderer {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn render_from_code(&self, code: &str, context: &RenderContext) -> RenderOutcome {
        debug!("[{}] 子进程渲染，代码长度 {} 字符", context.label, code.len());
        let result = self.run(code).await;
        if let Err(e) = &result {
            warn!("[{}] ⚠️  图形渲染失败: {}", context.label, e);
        }
        result.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_drops_user_imports() {
        let code = SandboxRenderer::prepare_code("import os\nplt.plot([0, 1], [0, 1])").unwrap();
        assert_eq!(code, "plt.plot([0, 1], [0, 1])");
    }

    #[test]
    fn test_prepare_rejects_dunder_escapes() {
        for code in [
            "__import__('os').system('id')",
            "plt.gcf().__class__.__mro__",
            "x = ().__class__.__base__.__subclasses__()",
        ] {
            assert!(
                matches!(
                    SandboxRenderer::prepare_code(code),
                    Err(RenderError::ForbiddenName(_))
                ),
                "应当拒绝: {}",
                code
            );
        }

        let code = "if __name__ == '__main__':\n    plt.plot([0], [0])";
        assert!(SandboxRenderer::prepare_code(code).is_ok());
    }

    #[test]
    fn test_driver_restricts_builtins_and_resources() {
        let restricted = "'__builtins__': {name: getattr(builtins, name) for name in ALLOWED}";
        assert!(DRIVER.contains(restricted));
        assert!(DRIVER.contains("RLIMIT_AS"));
        assert!(DRIVER.contains("RLIMIT_CPU"));
        let allowed = DRIVER
            .split("ALLOWED = (")
            .nth(1)
            .and_then(|rest| rest.split(')').next())
            .unwrap();
        for name in ["'open'", "'eval'", "'exec'", "'getattr'", "'__import__'", "'compile'"] {
            assert!(!allowed.contains(name), "{} 不应在白名单中", name);
        }
    }

    #[tokio::test]
    async fn test_forbidden_code_never_spawns() {
        let renderer =
            SandboxRenderer::new("definitely-not-a-real-interpreter", Duration::from_secs(1));
        let outcome = renderer
            .render_from_code("__import__('os').system('id')", &RenderContext::new("test"))
            .await;
        assert!(matches!(
            outcome,
            RenderOutcome::Failed { ref error } if error.contains("不允许的名称")
        ));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_failure() {
        let renderer =
            SandboxRenderer::new("definitely-not-a-real-interpreter", Duration::from_secs(1));
        let outcome = renderer
            .render_from_code("plt.plot([0], [0])", &RenderContext::new("test"))
            .await;
        assert!(matches!(
            outcome,
            RenderOutcome::Failed { ref error } if error.contains("无法启动")
        ));
    }

    #[tokio::test]
    async fn test_timeout_covers_stdin_write() {
        // sleep 从不读取 stdin，大于管道缓冲区的输入会让写入一直阻塞
        let Ok(child) = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        else {
            return;
        };
        let input = "#".repeat(4 * 1024 * 1024);

        let started = std::time::Instant::now();
        let result = exchange(child, input, Duration::from_millis(300)).await;
        assert!(matches!(result, Err(RenderError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
