//! Display-name → package mapping used by the `Launch` action.

use once_cell::sync::Lazy;
use std::collections::HashMap;

const APPS: &[(&str, &str)] = &[
    ("微信", "com.tencent.mm"),
    ("QQ", "com.tencent.mobileqq"),
    ("微博", "com.sina.weibo"),
    ("淘宝", "com.taobao.taobao"),
    ("京东", "com.jingdong.app.mall"),
    ("拼多多", "com.xunmeng.pinduoduo"),
    ("小红书", "com.xingin.xhs"),
    ("知乎", "com.zhihu.android"),
    ("高德地图", "com.autonavi.minimap"),
    ("百度地图", "com.baidu.BaiduMap"),
    ("美团", "com.sankuai.meituan"),
    ("大众点评", "com.dianping.v1"),
    ("饿了么", "me.ele"),
    ("携程", "ctrip.android.view"),
    ("12306", "com.MobileTicket"),
    ("铁路12306", "com.MobileTicket"),
    ("滴滴出行", "com.sdu.did.psnger"),
    ("bilibili", "tv.danmaku.bili"),
    ("抖音", "com.ss.android.ugc.aweme"),
    ("快手", "com.smile.gifmaker"),
    ("网易云音乐", "com.netease.cloudmusic"),
    ("QQ音乐", "com.tencent.qqmusic"),
    ("飞书", "com.ss.android.lark"),
    ("今日头条", "com.ss.android.article.news"),
    ("Settings", "com.android.settings"),
    ("Chrome", "com.android.chrome"),
    ("Google Chrome", "com.android.chrome"),
    ("Clock", "com.android.deskclock"),
    ("Contacts", "com.android.contacts"),
    ("Gmail", "com.google.android.gm"),
    ("Google Maps", "com.google.android.apps.maps"),
    ("YouTube", "com.google.android.youtube"),
    ("Camera", "com.android.camera"),
    ("Calculator", "com.android.calculator2"),
    ("Calendar", "com.android.calendar"),
    ("Messages", "com.android.mms"),
    ("Phone", "com.android.dialer"),
];

/// Mapping from normalized app names to Android package names.
pub static APP_PACKAGES: Lazy<HashMap<String, &'static str>> = Lazy::new(|| {
    APPS.iter()
        .map(|(name, package)| (normalize(name), *package))
        .collect()
});

/// Lowercase and drop whitespace/dashes so "google-chrome" finds "Google Chrome".
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Get the package name for an app by its display name.
pub fn get_package(app_name: &str) -> Option<&'static str> {
    APP_PACKAGES.get(&normalize(app_name)).copied()
}

/// Find the display name of the first known package mentioned in `text`.
pub fn find_app_in(text: &str) -> Option<&'static str> {
    APPS.iter()
        .find(|(_, package)| text.contains(package))
        .map(|(name, _)| *name)
}
