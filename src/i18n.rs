/// Simple localization support for OrangeUpdater.
/// Locale can be selected via the `--locale` CLI flag (e.g. `--locale zh`).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
    #[default]
    En,
    Zh,
}

impl Locale {
    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "zh" | "zh-cn" | "zh_cn" | "zh-hans" | "zh-tw" | "zh_tw" => Self::Zh,
            _ => Self::En,
        }
    }
}

pub struct Messages {
    pub update_available: &'static str,
    pub release_notes_header: &'static str,
    pub confirm_install: &'static str,
    pub confirm_suffix: &'static str,
    pub download_failed: &'static str,
    pub install_failed: &'static str,
    pub install_deferred: &'static str,
    pub exiting_after_install: &'static str,
    pub eta_unknown: &'static str,
    pub status_prefix: &'static str,
    pub error_prefix: &'static str,
}

pub static EN: Messages = Messages {
    update_available: "Update available",
    release_notes_header: "Release notes",
    confirm_install: "Install version",
    confirm_suffix: "and exit now?",
    download_failed: "Download failed",
    install_failed: "Install failed",
    install_deferred: "Install deferred; run again to install the downloaded update",
    exiting_after_install: "Update installed; exiting",
    eta_unknown: "-",
    status_prefix: "INFO",
    error_prefix: "ERR",
};

pub static ZH: Messages = Messages {
    update_available: "发现新版本",
    release_notes_header: "更新说明",
    confirm_install: "安装版本",
    confirm_suffix: "并立即退出？",
    download_failed: "下载失败",
    install_failed: "安装失败",
    install_deferred: "已暂缓安装；再次运行即可安装已下载的更新",
    exiting_after_install: "更新已安装，正在退出",
    eta_unknown: "-",
    status_prefix: "信息",
    error_prefix: "错误",
};

pub fn get_messages(locale: Locale) -> &'static Messages {
    match locale {
        Locale::En => &EN,
        Locale::Zh => &ZH,
    }
}
