// cli.rs — 命令行接口定义模块
// 使用 clap 的 derive 模式定义所有子命令和参数

use crate::config::API_KEY_ENV;
use clap::{ArgAction, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// 从 Wallhaven 收藏夹批量下载壁纸
#[derive(Parser, Debug)]
#[command(name = "whcollect")]
#[command(version)]
#[command(author)]
#[command(about = "Download wallpapers from your wallhaven collections")]
pub struct Cli {
    /// 输出更多诊断日志（-v 为 info，-vv 为 debug；RUST_LOG 优先）
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// 配置文件路径（默认 ~/.config/whcollect/config.toml）
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 下载一个或多个收藏夹中的全部壁纸
    ///
    /// 用法示例:
    ///   whcollect fetch alice Default Space
    ///   whcollect fetch alice 1234567 -d ~/Pictures/walls --flat -j 8
    Fetch {
        /// Wallhaven 用户名
        username: String,

        /// 收藏夹名称（label）或 ID，可以有多个
        #[arg(required = true, num_args = 1..)]
        collections: Vec<String>,

        /// Wallhaven API Key（访问私有收藏夹时需要）
        #[arg(short, long, env = API_KEY_ENV, hide_env_values = true)]
        api_key: Option<String>,

        /// 保存目录（必须已存在；默认使用配置中的 output_dir）
        #[arg(short, long = "dest", value_name = "DIR")]
        dest: Option<PathBuf>,

        /// 不为每个收藏夹创建子目录
        #[arg(short, long)]
        flat: bool,

        /// 同时进行的下载数 (1-16)
        #[arg(short = 'j', long = "jobs", value_name = "N",
              value_parser = clap::value_parser!(u16).range(1..=16))]
        jobs: Option<u16>,
    },

    /// 列出用户的收藏夹
    ///
    /// 用法示例:
    ///   whcollect list alice
    List {
        /// Wallhaven 用户名
        username: String,

        /// Wallhaven API Key（提供后会列出私有收藏夹）
        #[arg(short, long, env = API_KEY_ENV, hide_env_values = true)]
        api_key: Option<String>,
    },

    /// 配置管理操作
    ///
    /// 用法示例:
    ///   whcollect config show
    ///   whcollect config set concurrency 8
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// 生成 shell 补全脚本（支持 bash, zsh, fish, elvish, powershell）
    ///
    /// 用法示例：
    ///   whcollect completions zsh > ~/.zsh/completions/_whcollect
    Completions {
        /// 目标 shell 类型
        shell: Shell,
    },
}

/// 配置管理操作
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// 查看当前配置简报
    Show,
    /// 打印配置文件路径
    Path,
    /// 生成配置文件对应的 JSON Schema
    Schema,
    /// 以 TOML 格式打印当前完整配置内容
    Dump,
    /// 设置配置项 (output_dir, flat, concurrency, api_key, base_url, timeout_secs)
    Set {
        /// 要设置的键
        key: String,
        /// 要设置的值
        value: String,
    },
}
